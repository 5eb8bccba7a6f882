//! The transformation runtime: executes a compiled stylesheet's instruction
//! AST against a source tree, pushing events into an output [`Serializer`].
use std::collections::HashMap;
use std::sync::Arc;

use log::warn;
use xsltransform_xpath::functions::FunctionRegistry;
use xsltransform_xpath::parser::parse_expression;
use xsltransform_xpath::{EvaluationContext, XPathValue, evaluate};

use crate::ast::{
    AttributeSetDef, Avt, AvtPart, CompiledStylesheet, GlobalBinding, Instruction, NumberInstr,
    NumberLevel, OutputProperties, SortKey, Template, WithParam, XPathExpr,
};
use crate::error::{ErrorHandlingMode, XsltError};
use crate::matcher::{self, MatchOutcome};
use crate::serializer::Serializer;
use crate::tree::Node;

pub type Value<'a> = XPathValue<Node<'a>>;

/// Caller-supplied knobs for one run of [`crate::Stylesheet::transform`].
pub struct TransformOptions {
    pub error_mode: ErrorHandlingMode,
    /// Initial mode for entry point (a): `apply-templates` to the source root.
    pub initial_mode: Option<String>,
    /// Entry point (b): invoke a named template instead of matching the root.
    pub initial_template: Option<String>,
    /// Entry point (c): an XPath expression selecting the initial context
    /// node(s), evaluated against the source root, in place of the root itself.
    pub initial_select: Option<String>,
    pub params: HashMap<String, String>,
    pub output_override: Option<OutputProperties>,
    /// Polled at each `apply-templates` call site; returning true aborts the
    /// transformation with a fatal, best-effort-flushed error.
    pub cancel: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
}

impl Default for TransformOptions {
    fn default() -> Self {
        TransformOptions {
            error_mode: ErrorHandlingMode::default(),
            initial_mode: None,
            initial_template: None,
            initial_select: None,
            params: HashMap::new(),
            output_override: None,
            cancel: None,
        }
    }
}

struct Scope<'a> {
    frames: Vec<HashMap<String, Value<'a>>>,
    tunnel: Vec<HashMap<String, Value<'a>>>,
}

impl<'a> Scope<'a> {
    fn new() -> Self {
        Scope {
            frames: vec![HashMap::new()],
            tunnel: vec![HashMap::new()],
        }
    }

    fn bind(&mut self, name: &str, value: Value<'a>) -> Result<(), XsltError> {
        let top = self.frames.last_mut().expect("at least one frame");
        if top.contains_key(name) {
            return Err(XsltError::Execution(format!(
                "variable '{name}' already bound in this scope"
            )));
        }
        top.insert(name.to_string(), value);
        Ok(())
    }

    fn push_frame(&mut self) {
        self.frames.push(HashMap::new());
    }

    fn pop_frame(&mut self) {
        self.frames.pop();
    }
}

pub struct Transformation<'s, 'a> {
    sheet: &'s CompiledStylesheet,
    functions: FunctionRegistry,
    key_indexes: HashMap<String, HashMap<String, Vec<Node<'a>>>>,
    error_mode: ErrorHandlingMode,
    cancel: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
    root: Node<'a>,
}

impl<'s, 'a> Transformation<'s, 'a> {
    pub fn new(sheet: &'s CompiledStylesheet, root: Node<'a>, options: &TransformOptions) -> Self {
        let key_indexes = build_key_indexes(sheet, root, options.error_mode);
        Transformation {
            sheet,
            functions: FunctionRegistry::default(),
            key_indexes,
            error_mode: options.error_mode,
            cancel: options.cancel.clone(),
            root,
        }
    }

    pub fn run(&mut self, options: &TransformOptions) -> Result<String, XsltError> {
        let output = options
            .output_override
            .clone()
            .unwrap_or_else(|| self.sheet.output.clone());
        let character_map = resolve_character_map(self.sheet, &output.use_character_maps);
        let mut serializer = Serializer::new(output, character_map, self.error_mode);

        let mut scope = Scope::new();
        self.bind_globals(&mut scope)?;
        for (name, value) in &options.params {
            let _ = scope.bind(name, Value::String(value.clone()));
        }

        if let Some(name) = &options.initial_template {
            let template = matcher::find_named_template(self.sheet, name).ok_or_else(|| {
                XsltError::Execution(format!("no named template '{name}' for initial-template entry point"))
            })?;
            scope.push_frame();
            self.exec_body(&template.body, self.root, 1, 1, self.root, Some(template), &mut scope, &mut serializer)?;
            scope.pop_frame();
        } else {
            let initial_nodes = if let Some(select) = &options.initial_select {
                let expr = parse_expression(select)?;
                self.select_nodes(&expr, self.root, 1, 1, self.root, &scope)?
            } else {
                vec![self.root]
            };
            let mode = options.initial_mode.clone();
            for node in initial_nodes {
                self.apply_single(node, mode.as_deref(), &mut scope, &mut serializer, &HashMap::new())?;
            }
        }
        Ok(serializer.finish())
    }

    fn bind_globals(&self, scope: &mut Scope<'a>) -> Result<(), XsltError> {
        for binding in &self.sheet.global_variables {
            let value = self.eval_binding(binding, self.root, scope)?;
            scope.bind(&binding.name, value)?;
        }
        Ok(())
    }

    fn eval_binding(
        &self,
        binding: &GlobalBinding,
        context: Node<'a>,
        scope: &Scope<'a>,
    ) -> Result<Value<'a>, XsltError> {
        if let Some(select) = &binding.select {
            self.eval_xpath(select, context, 1, 1, context, scope)
        } else if let Some(body) = &binding.body {
            Ok(Value::String(self.render_fragment(body, context, 1, 1, context, None, scope)?))
        } else {
            Ok(Value::String(String::new()))
        }
    }

    fn eval_xpath(
        &self,
        expr: &XPathExpr,
        context_node: Node<'a>,
        position: usize,
        size: usize,
        current: Node<'a>,
        scope: &Scope<'a>,
    ) -> Result<Value<'a>, XsltError> {
        let vars = collect_variables(scope);
        let e_ctx = EvaluationContext::with_current(
            context_node,
            current,
            self.root,
            &self.functions,
            position,
            size,
            &vars,
            &self.key_indexes,
            self.error_mode == ErrorHandlingMode::Strict,
        );
        Ok(evaluate(expr, &e_ctx)?)
    }

    fn select_nodes(
        &self,
        expr: &XPathExpr,
        context_node: Node<'a>,
        position: usize,
        size: usize,
        current: Node<'a>,
        scope: &Scope<'a>,
    ) -> Result<Vec<Node<'a>>, XsltError> {
        match self.eval_xpath(expr, context_node, position, size, current, scope)? {
            Value::NodeSet(nodes) => Ok(nodes),
            other => {
                warn!("expected a node-set, got a {other}; treating as an empty sequence");
                Ok(Vec::new())
            }
        }
    }

    /// Renders a template body to a plain string, used for result-tree
    /// fragments (a `variable`/`param` bound to a body instead of `select`).
    /// This engine represents such fragments by their string value rather
    /// than as a detached node-set, matching what core XSLT 1.0 (without the
    /// `node-set()` extension function) can observe about them anyway.
    #[allow(clippy::too_many_arguments)]
    fn render_fragment(
        &self,
        body: &[Instruction],
        context_node: Node<'a>,
        position: usize,
        size: usize,
        current: Node<'a>,
        current_template: Option<&'s Template>,
        scope: &Scope<'a>,
    ) -> Result<String, XsltError> {
        let output = OutputProperties {
            method: crate::ast::OutputMethod::Text,
            ..Default::default()
        };
        let mut serializer = Serializer::new(output, HashMap::new(), self.error_mode);
        let mut scope_copy = Scope {
            frames: scope.frames.clone(),
            tunnel: scope.tunnel.clone(),
        };
        self.exec_body(body, context_node, position, size, current, current_template, &mut scope_copy, &mut serializer)?;
        Ok(serializer.finish())
    }

    #[allow(clippy::too_many_arguments)]
    fn exec_body(
        &self,
        body: &[Instruction],
        context_node: Node<'a>,
        position: usize,
        size: usize,
        current: Node<'a>,
        current_template: Option<&'s Template>,
        scope: &mut Scope<'a>,
        out: &mut Serializer,
    ) -> Result<(), XsltError> {
        for instr in body {
            self.exec(instr, context_node, position, size, current, current_template, scope, out)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn exec(
        &self,
        instr: &Instruction,
        context_node: Node<'a>,
        position: usize,
        size: usize,
        current: Node<'a>,
        current_template: Option<&'s Template>,
        scope: &mut Scope<'a>,
        out: &mut Serializer,
    ) -> Result<(), XsltError> {
        match instr {
            Instruction::LiteralText(text) => out.text(text, false),
            Instruction::Text { disable_output_escaping, content } => {
                out.text(content, *disable_output_escaping)
            }
            Instruction::ValueOf { select, separator, disable_output_escaping } => {
                let value = self.eval_xpath(select, context_node, position, size, current, scope)?;
                let text = match (&value, separator) {
                    (Value::NodeSet(nodes), Some(sep_avt)) => {
                        let sep = self.eval_avt(sep_avt, context_node, position, size, current, scope)?;
                        nodes
                            .iter()
                            .map(|n| xsltransform_xpath::DataSourceNode::string_value(n))
                            .collect::<Vec<_>>()
                            .join(&sep)
                    }
                    _ => value.to_string(),
                };
                out.text(&text, *disable_output_escaping);
            }
            Instruction::LiteralElement {
                prefix,
                local_name,
                namespace_decls,
                attributes,
                use_attribute_sets,
                body,
            } => {
                let qname = qualify(prefix.as_deref(), local_name);
                out.start_element(&qname, namespace_decls.clone());
                self.emit_attribute_sets(use_attribute_sets, context_node, position, size, current, current_template, scope, out)?;
                for attr in attributes {
                    let name = qualify(attr.prefix.as_deref(), &attr.local_name);
                    let value = self.eval_avt(&attr.value, context_node, position, size, current, scope)?;
                    out.attribute(&name, &value)?;
                }
                self.exec_body(body, context_node, position, size, current, current_template, scope, out)?;
                out.end_element(&qname);
            }
            Instruction::Element { name, namespace, use_attribute_sets, body } => {
                let qname = self.eval_avt(name, context_node, position, size, current, scope)?;
                let _ns = namespace
                    .as_ref()
                    .map(|n| self.eval_avt(n, context_node, position, size, current, scope))
                    .transpose()?;
                out.start_element(&qname, Vec::new());
                self.emit_attribute_sets(use_attribute_sets, context_node, position, size, current, current_template, scope, out)?;
                self.exec_body(body, context_node, position, size, current, current_template, scope, out)?;
                out.end_element(&qname);
            }
            Instruction::Attribute { name, namespace: _, body } => {
                let qname = self.eval_avt(name, context_node, position, size, current, scope)?;
                let value = self.render_fragment(body, context_node, position, size, current, current_template, scope)?;
                out.attribute(&qname, &value)?;
            }
            Instruction::Copy { use_attribute_sets, body } => {
                self.exec_copy(context_node, use_attribute_sets, body, position, size, current, current_template, scope, out)?;
            }
            Instruction::CopyOf { select } => {
                let value = self.eval_xpath(select, context_node, position, size, current, scope)?;
                match value {
                    Value::NodeSet(nodes) => {
                        for node in nodes {
                            self.deep_copy(node, out)?;
                        }
                    }
                    other => out.text(&other.to_string(), false),
                }
            }
            Instruction::Variable { name, select, body } | Instruction::ParamBinding { name, select, body } => {
                let value = if let Some(select) = select {
                    self.eval_xpath(select, context_node, position, size, current, scope)?
                } else if let Some(body) = body {
                    Value::String(self.render_fragment(body, context_node, position, size, current, current_template, scope)?)
                } else {
                    Value::String(String::new())
                };
                scope.bind(name, value)?;
            }
            Instruction::If { test, body } => {
                if self.eval_xpath(test, context_node, position, size, current, scope)?.to_bool() {
                    scope.push_frame();
                    self.exec_body(body, context_node, position, size, current, current_template, scope, out)?;
                    scope.pop_frame();
                }
            }
            Instruction::Choose { whens, otherwise } => {
                let mut matched = false;
                for (test, body) in whens {
                    if self.eval_xpath(test, context_node, position, size, current, scope)?.to_bool() {
                        scope.push_frame();
                        self.exec_body(body, context_node, position, size, current, current_template, scope, out)?;
                        scope.pop_frame();
                        matched = true;
                        break;
                    }
                }
                if !matched {
                    if let Some(body) = otherwise {
                        scope.push_frame();
                        self.exec_body(body, context_node, position, size, current, current_template, scope, out)?;
                        scope.pop_frame();
                    }
                }
            }
            Instruction::ForEach { select, sorts, body } => {
                let mut nodes = self.select_nodes(select, context_node, position, size, current, scope)?;
                self.apply_sorts(sorts, &mut nodes, scope)?;
                let total = nodes.len();
                for (idx, node) in nodes.iter().enumerate() {
                    scope.push_frame();
                    self.exec_body(body, *node, idx + 1, total, *node, current_template, scope, out)?;
                    scope.pop_frame();
                }
            }
            Instruction::ApplyTemplates { select, mode, sorts, with_params } => {
                if let Some(cancel) = &self.cancel {
                    if cancel() {
                        return Err(XsltError::Cancelled);
                    }
                }
                let default_select = parse_expression("child::node()")?;
                let expr = select.as_ref().unwrap_or(&default_select);
                let mut nodes = self.select_nodes(expr, context_node, position, size, current, scope)?;
                self.apply_sorts(sorts, &mut nodes, scope)?;
                let tunnel = self.eval_tunnel_params(with_params, context_node, position, size, current, scope)?;
                let with_param_values = self.eval_with_params(with_params, context_node, position, size, current, scope)?;
                let total = nodes.len();
                for (idx, node) in nodes.iter().enumerate() {
                    self.apply_one(*node, mode.as_deref(), idx + 1, total, scope, out, &with_param_values, &tunnel)?;
                }
            }
            Instruction::CallTemplate { name, with_params } => {
                let template = matcher::find_named_template(self.sheet, name).ok_or_else(|| {
                    XsltError::Execution(format!("no template named '{name}'"))
                })?;
                let tunnel = self.eval_tunnel_params(with_params, context_node, position, size, current, scope)?;
                let with_param_values = self.eval_with_params(with_params, context_node, position, size, current, scope)?;
                self.invoke_template(template, context_node, scope, out, &with_param_values, &tunnel)?;
            }
            Instruction::ApplyImports { with_params } => {
                let current_template = current_template.ok_or_else(|| {
                    XsltError::Execution("xsl:apply-imports outside a template body".to_string())
                })?;
                let tunnel = self.eval_tunnel_params(with_params, context_node, position, size, current, scope)?;
                let with_param_values = self.eval_with_params(with_params, context_node, position, size, current, scope)?;
                match matcher::find_template_apply_imports(
                    self.sheet,
                    context_node,
                    current_template.mode.as_deref(),
                    current_template,
                    self.error_mode,
                )? {
                    MatchOutcome::Template(template) => {
                        self.invoke_template_at(template, context_node, position, size, scope, out, &with_param_values, &tunnel)?
                    }
                    MatchOutcome::BuiltIn => self.run_built_in_rule(context_node, current_template.mode.as_deref(), scope, out)?,
                }
            }
            Instruction::NextMatch { with_params } => {
                let current_template = current_template.ok_or_else(|| {
                    XsltError::Execution("xsl:next-match outside a template body".to_string())
                })?;
                let tunnel = self.eval_tunnel_params(with_params, context_node, position, size, current, scope)?;
                let with_param_values = self.eval_with_params(with_params, context_node, position, size, current, scope)?;
                match matcher::find_template_next_match(
                    self.sheet,
                    context_node,
                    current_template.mode.as_deref(),
                    current_template,
                    self.error_mode,
                )? {
                    MatchOutcome::Template(template) => {
                        self.invoke_template_at(template, context_node, position, size, scope, out, &with_param_values, &tunnel)?
                    }
                    MatchOutcome::BuiltIn => self.run_built_in_rule(context_node, current_template.mode.as_deref(), scope, out)?,
                }
            }
            Instruction::Fallback { body } => {
                self.exec_body(body, context_node, position, size, current, current_template, scope, out)?;
            }
            Instruction::Number(number) => {
                let text = self.format_number_instr(number, context_node, position, size, current, scope)?;
                out.text(&text, false);
            }
            Instruction::Message { terminate, body } => {
                let text = self.render_fragment(body, context_node, position, size, current, current_template, scope)?;
                if *terminate {
                    return Err(XsltError::Terminated(text));
                }
                log::info!("xsl:message: {text}");
            }
            Instruction::Comment { body } => {
                let text = self.render_fragment(body, context_node, position, size, current, current_template, scope)?;
                out.comment(&sanitize_comment(&text));
            }
            Instruction::ProcessingInstruction { name, body } => {
                let target = self.eval_avt(name, context_node, position, size, current, scope)?;
                let data = self.render_fragment(body, context_node, position, size, current, current_template, scope)?;
                out.processing_instruction(&target, &sanitize_pi(&data));
            }
            Instruction::Namespace { name, select, body } => {
                let _prefix = self.eval_avt(name, context_node, position, size, current, scope)?;
                let _uri = if let Some(select) = select {
                    self.eval_xpath(select, context_node, position, size, current, scope)?.to_string()
                } else if let Some(body) = body {
                    self.render_fragment(body, context_node, position, size, current, current_template, scope)?
                } else {
                    String::new()
                };
                // Namespace nodes on the result tree have no visible effect
                // on this engine's event-stream serializer beyond the
                // `xmlns` declarations already carried by literal elements.
            }
        }
        Ok(())
    }

    fn apply_single(
        &self,
        node: Node<'a>,
        mode: Option<&str>,
        scope: &mut Scope<'a>,
        out: &mut Serializer,
        with_params: &HashMap<String, Value<'a>>,
    ) -> Result<(), XsltError> {
        self.apply_one(node, mode, 1, 1, scope, out, with_params, &HashMap::new())
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_one(
        &self,
        node: Node<'a>,
        mode: Option<&str>,
        position: usize,
        size: usize,
        scope: &mut Scope<'a>,
        out: &mut Serializer,
        with_params: &HashMap<String, Value<'a>>,
        tunnel: &HashMap<String, Value<'a>>,
    ) -> Result<(), XsltError> {
        match matcher::find_template(self.sheet, node, mode, self.error_mode)? {
            MatchOutcome::Template(template) => {
                self.invoke_template_at(template, node, position, size, scope, out, with_params, tunnel)
            }
            MatchOutcome::BuiltIn => self.run_built_in_rule(node, mode, scope, out),
        }
    }

    fn invoke_template(
        &self,
        template: &'s Template,
        context: Node<'a>,
        scope: &mut Scope<'a>,
        out: &mut Serializer,
        with_params: &HashMap<String, Value<'a>>,
        tunnel: &HashMap<String, Value<'a>>,
    ) -> Result<(), XsltError> {
        self.invoke_template_at(template, context, 1, 1, scope, out, with_params, tunnel)
    }

    #[allow(clippy::too_many_arguments)]
    fn invoke_template_at(
        &self,
        template: &'s Template,
        context: Node<'a>,
        position: usize,
        size: usize,
        scope: &mut Scope<'a>,
        out: &mut Serializer,
        with_params: &HashMap<String, Value<'a>>,
        tunnel: &HashMap<String, Value<'a>>,
    ) -> Result<(), XsltError> {
        scope.frames.push(HashMap::new());
        scope.tunnel.push(tunnel.clone());
        for param in &template.params {
            let value = if let Some(v) = with_params.get(&param.name) {
                v.clone()
            } else if let Some(select) = &param.select {
                self.eval_xpath(select, context, position, size, context, scope)?
            } else if let Some(body) = &param.body {
                Value::String(self.render_fragment(body, context, position, size, context, Some(template), scope)?)
            } else {
                Value::String(String::new())
            };
            scope
                .frames
                .last_mut()
                .unwrap()
                .insert(param.name.clone(), value);
        }
        let result = self.exec_body(&template.body, context, position, size, context, Some(template), scope, out);
        scope.tunnel.pop();
        scope.frames.pop();
        result
    }

    fn run_built_in_rule(
        &self,
        node: Node<'a>,
        mode: Option<&str>,
        scope: &mut Scope<'a>,
        out: &mut Serializer,
    ) -> Result<(), XsltError> {
        use xsltransform_xpath::{DataSourceNode, NodeType};
        match node.node_type() {
            NodeType::Root | NodeType::Element => {
                let children: Vec<_> = node.children().collect();
                let total = children.len();
                for (idx, child) in children.iter().enumerate() {
                    self.apply_one(*child, mode, idx + 1, total, scope, out, &HashMap::new(), &HashMap::new())?;
                }
            }
            NodeType::Text | NodeType::Attribute => {
                out.text(&node.string_value(), false);
            }
            _ => {}
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn exec_copy(
        &self,
        node: Node<'a>,
        use_attribute_sets: &[String],
        body: &[Instruction],
        position: usize,
        size: usize,
        current: Node<'a>,
        current_template: Option<&'s Template>,
        scope: &mut Scope<'a>,
        out: &mut Serializer,
    ) -> Result<(), XsltError> {
        use xsltransform_xpath::{DataSourceNode, NodeType};
        match node.node_type() {
            NodeType::Element => {
                let qname = qualify(node.prefix(), node.local_name());
                out.start_element(&qname, Vec::new());
                self.emit_attribute_sets(use_attribute_sets, node, position, size, current, current_template, scope, out)?;
                self.exec_body(body, node, position, size, current, current_template, scope, out)?;
                out.end_element(&qname);
            }
            NodeType::Attribute => {
                out.attribute(&qualify(node.prefix(), node.local_name()), &node.string_value())?;
            }
            NodeType::Text => out.text(&node.string_value(), false),
            NodeType::Comment => out.comment(&sanitize_comment(&node.string_value())),
            NodeType::ProcessingInstruction => {
                out.processing_instruction(node.local_name(), &sanitize_pi(&node.string_value()))
            }
            NodeType::Root => self.exec_body(body, node, position, size, current, current_template, scope, out)?,
            NodeType::Namespace => {}
        }
        Ok(())
    }

    fn deep_copy(&self, node: Node<'a>, out: &mut Serializer) -> Result<(), XsltError> {
        use xsltransform_xpath::{DataSourceNode, NodeType};
        match node.node_type() {
            NodeType::Root => {
                for child in node.children() {
                    self.deep_copy(child, out)?;
                }
            }
            NodeType::Element => {
                let qname = qualify(node.prefix(), node.local_name());
                out.start_element(&qname, Vec::new());
                for attr in node.attributes() {
                    out.attribute(&qualify(attr.prefix(), attr.local_name()), &attr.string_value())?;
                }
                for child in node.children() {
                    self.deep_copy(child, out)?;
                }
                out.end_element(&qname);
            }
            NodeType::Attribute => {
                out.attribute(&qualify(node.prefix(), node.local_name()), &node.string_value())?;
            }
            NodeType::Text => out.text(&node.string_value(), false),
            NodeType::Comment => out.comment(&sanitize_comment(&node.string_value())),
            NodeType::ProcessingInstruction => {
                out.processing_instruction(node.local_name(), &sanitize_pi(&node.string_value()))
            }
            NodeType::Namespace => {}
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_attribute_sets(
        &self,
        names: &[String],
        context_node: Node<'a>,
        position: usize,
        size: usize,
        current: Node<'a>,
        current_template: Option<&'s Template>,
        scope: &mut Scope<'a>,
        out: &mut Serializer,
    ) -> Result<(), XsltError> {
        for name in names {
            if let Some(AttributeSetDef { uses, attributes }) = self.sheet.attribute_sets.get(name) {
                self.emit_attribute_sets(uses, context_node, position, size, current, current_template, scope, out)?;
                for attr in attributes {
                    self.exec(attr, context_node, position, size, current, current_template, scope, out)?;
                }
            }
        }
        Ok(())
    }

    fn eval_avt(
        &self,
        avt: &Avt,
        context_node: Node<'a>,
        position: usize,
        size: usize,
        current: Node<'a>,
        scope: &Scope<'a>,
    ) -> Result<String, XsltError> {
        let mut out = String::new();
        for part in &avt.0 {
            match part {
                AvtPart::Literal(s) => out.push_str(s),
                AvtPart::Expr(expr) => {
                    let value = self.eval_xpath(expr, context_node, position, size, current, scope)?;
                    out.push_str(&value.to_string());
                }
            }
        }
        Ok(out)
    }

    fn apply_sorts(&self, sorts: &[SortKey], nodes: &mut [Node<'a>], scope: &Scope<'a>) -> Result<(), XsltError> {
        if sorts.is_empty() {
            return Ok(());
        }
        let total = nodes.len();
        let mut keyed: Vec<(Node<'a>, Vec<Value<'a>>)> = Vec::with_capacity(total);
        for (idx, node) in nodes.iter().enumerate() {
            let mut keys = Vec::with_capacity(sorts.len());
            for sort in sorts {
                keys.push(self.eval_xpath(&sort.select, *node, idx + 1, total, *node, scope)?);
            }
            keyed.push((*node, keys));
        }
        // `sort_by` is a stable sort; composing comparisons left-to-right and
        // relying on stability satisfies every `sort`'s own `stable` default.
        keyed.sort_by(|a, b| {
            for (i, sort) in sorts.iter().enumerate() {
                let ordering = compare_sort_values(&a.1[i], &b.1[i], sort);
                if ordering != std::cmp::Ordering::Equal {
                    return ordering;
                }
            }
            std::cmp::Ordering::Equal
        });
        for (slot, (node, _)) in nodes.iter_mut().zip(keyed) {
            *slot = node;
        }
        Ok(())
    }

    fn eval_with_params(
        &self,
        with_params: &[WithParam],
        context_node: Node<'a>,
        position: usize,
        size: usize,
        current: Node<'a>,
        scope: &Scope<'a>,
    ) -> Result<HashMap<String, Value<'a>>, XsltError> {
        let mut out = HashMap::new();
        for p in with_params.iter().filter(|p| !p.tunnel) {
            out.insert(p.name.clone(), self.eval_xpath(&p.select, context_node, position, size, current, scope)?);
        }
        Ok(out)
    }

    fn eval_tunnel_params(
        &self,
        with_params: &[WithParam],
        context_node: Node<'a>,
        position: usize,
        size: usize,
        current: Node<'a>,
        scope: &Scope<'a>,
    ) -> Result<HashMap<String, Value<'a>>, XsltError> {
        let mut out = scope.tunnel.last().cloned().unwrap_or_default();
        for p in with_params.iter().filter(|p| p.tunnel) {
            out.insert(p.name.clone(), self.eval_xpath(&p.select, context_node, position, size, current, scope)?);
        }
        Ok(out)
    }

    fn format_number_instr(
        &self,
        number: &NumberInstr,
        context_node: Node<'a>,
        position: usize,
        size: usize,
        current: Node<'a>,
        scope: &Scope<'a>,
    ) -> Result<String, XsltError> {
        let values = if let Some(value_expr) = &number.value {
            vec![self.eval_xpath(value_expr, context_node, position, size, current, scope)?.to_number()]
        } else {
            self.compute_place_values(number, context_node)
        };
        Ok(format_number_sequence(&values, &number.format, number.grouping_separator, number.grouping_size))
    }

    fn compute_place_values(&self, number: &NumberInstr, context_node: Node<'a>) -> Vec<f64> {
        use xsltransform_xpath::DataSourceNode;
        let count_pattern = number.count.clone();
        let matches_count = |n: Node<'a>, default_from: &Node<'a>| -> bool {
            match &count_pattern {
                Some(p) => p.matches(n, self.root),
                None => n.node_type() == xsltransform_xpath::NodeType::Element
                    && n.local_name() == default_from.local_name()
                    && n.prefix() == default_from.prefix(),
            }
        };
        match number.level {
            NumberLevel::Single => {
                let mut node = context_node;
                loop {
                    if matches_count(node, &context_node) {
                        break;
                    }
                    match node.parent() {
                        Some(p) => node = p,
                        None => return vec![1.0],
                    }
                    if number.from.as_ref().is_some_and(|f| f.matches(node, self.root)) {
                        return vec![1.0];
                    }
                }
                let count = node
                    .parent()
                    .into_iter()
                    .flat_map(|p| p.children())
                    .take_while(|sib| *sib != node)
                    .filter(|sib| matches_count(*sib, &node))
                    .count()
                    + 1;
                vec![count as f64]
            }
            NumberLevel::Multiple => {
                let mut chain = Vec::new();
                let mut node = Some(context_node);
                while let Some(n) = node {
                    if matches_count(n, &context_node) {
                        let count = n
                            .parent()
                            .into_iter()
                            .flat_map(|p| p.children())
                            .take_while(|sib| *sib != n)
                            .filter(|sib| matches_count(*sib, &n))
                            .count()
                            + 1;
                        chain.push(count as f64);
                    }
                    if number.from.as_ref().is_some_and(|f| f.matches(n, self.root)) {
                        break;
                    }
                    node = n.parent();
                }
                chain.reverse();
                if chain.is_empty() {
                    vec![1.0]
                } else {
                    chain
                }
            }
            NumberLevel::Any => {
                let mut count = 0usize;
                let mut saw_from = number.from.is_none();
                self.count_any(self.root, context_node, &mut count, &mut saw_from, number);
                vec![count.max(1) as f64]
            }
        }
    }

    fn count_any(
        &self,
        node: Node<'a>,
        target: Node<'a>,
        count: &mut usize,
        saw_from: &mut bool,
        number: &NumberInstr,
    ) -> bool {
        use xsltransform_xpath::DataSourceNode;
        if node == target {
            return true;
        }
        if number.from.as_ref().is_some_and(|f| f.matches(node, self.root)) {
            *saw_from = true;
            *count = 0;
        } else if *saw_from {
            let matches = match &number.count {
                Some(p) => p.matches(node, self.root),
                None => node.node_type() == xsltransform_xpath::NodeType::Element,
            };
            if matches {
                *count += 1;
            }
        }
        for child in node.children() {
            if self.count_any(child, target, count, saw_from, number) {
                return true;
            }
        }
        false
    }
}

fn compare_sort_values(a: &Value<'_>, b: &Value<'_>, sort: &SortKey) -> std::cmp::Ordering {
    let ordering = if sort.numeric {
        a.to_number().partial_cmp(&b.to_number()).unwrap_or(std::cmp::Ordering::Equal)
    } else {
        let (sa, sb) = (a.to_string(), b.to_string());
        match sort.upper_first {
            Some(true) => sa.to_uppercase().cmp(&sb.to_uppercase()).then(sa.cmp(&sb)),
            _ => sa.cmp(&sb),
        }
    };
    if sort.descending { ordering.reverse() } else { ordering }
}

fn collect_variables<'a>(scope: &Scope<'a>) -> HashMap<String, Value<'a>> {
    let mut out = HashMap::new();
    // Tunnel bindings first so an ordinary lexical frame can shadow them,
    // matching how a tunnel param is still an ordinary in-scope variable to
    // `$name` lookups within the templates it threads through.
    for frame in &scope.tunnel {
        for (k, v) in frame {
            out.insert(k.clone(), v.clone());
        }
    }
    for frame in &scope.frames {
        for (k, v) in frame {
            out.insert(k.clone(), v.clone());
        }
    }
    out
}

fn qualify(prefix: Option<&str>, local: &str) -> String {
    match prefix {
        Some(p) if !p.is_empty() => format!("{p}:{local}"),
        _ => local.to_string(),
    }
}

fn sanitize_comment(text: &str) -> String {
    text.replace("--", "- -")
}

fn sanitize_pi(text: &str) -> String {
    text.replace("?>", "? >")
}

fn build_key_indexes<'a>(
    sheet: &CompiledStylesheet,
    root: Node<'a>,
    error_mode: ErrorHandlingMode,
) -> HashMap<String, HashMap<String, Vec<Node<'a>>>> {
    use xsltransform_xpath::DataSourceNode;

    let functions = FunctionRegistry::default();
    let empty_vars = HashMap::new();
    let empty_keys = HashMap::new();

    let mut indexes: HashMap<String, HashMap<String, Vec<Node<'a>>>> = HashMap::new();
    for (key_name, defs) in &sheet.keys {
        let mut by_value: HashMap<String, Vec<Node<'a>>> = HashMap::new();
        for def in defs {
            walk(root, &mut |node| {
                if !def.match_pattern.matches(node, root) {
                    return;
                }
                let e_ctx = EvaluationContext::new(
                    node,
                    root,
                    &functions,
                    1,
                    1,
                    &empty_vars,
                    &empty_keys,
                    error_mode == ErrorHandlingMode::Strict,
                );
                match evaluate(&def.use_expr, &e_ctx) {
                    Ok(Value::NodeSet(nodes)) => {
                        for n in nodes {
                            by_value.entry(n.string_value()).or_default().push(node);
                        }
                    }
                    Ok(other) => {
                        by_value.entry(other.to_string()).or_default().push(node);
                    }
                    Err(err) => warn!("key '{key_name}' use-expression failed: {err}"),
                }
            });
        }
        indexes.insert(key_name.clone(), by_value);
    }
    indexes
}

fn walk<'a>(node: Node<'a>, f: &mut impl FnMut(Node<'a>)) {
    use xsltransform_xpath::DataSourceNode;
    f(node);
    for attr in node.attributes() {
        f(attr);
    }
    for child in node.children() {
        walk(child, f);
    }
}

fn resolve_character_map(sheet: &CompiledStylesheet, names: &[String]) -> HashMap<char, String> {
    let mut out = HashMap::new();
    for name in names {
        if let Some(map) = sheet.character_maps.get(name) {
            let nested = resolve_character_map(sheet, &map.uses);
            out.extend(nested);
            out.extend(map.mappings.clone());
        }
    }
    out
}

/// Formats a place-value sequence per a (subset of) the XSLT `format`
/// mini-grammar: a leading/trailing non-alphanumeric separator run around
/// each numbering token, `1`/`01`/... for decimal (zero-padding to the
/// token's digit width), `a`/`A` for alphabetic, `i`/`I` for roman numerals.
fn format_number_sequence(
    values: &[f64],
    format: &str,
    grouping_separator: Option<char>,
    grouping_size: Option<u32>,
) -> String {
    let tokens = split_format_tokens(format);
    let mut out = String::new();
    for (idx, value) in values.iter().enumerate() {
        let n = value.max(1.0).round() as u64;
        let (prefix, token, suffix) = if idx < tokens.len() {
            tokens[idx].clone()
        } else {
            tokens.last().cloned().unwrap_or_else(|| (String::new(), "1".to_string(), String::new()))
        };
        out.push_str(&prefix);
        out.push_str(&format_one(n, &token, grouping_separator, grouping_size));
        out.push_str(&suffix);
    }
    out
}

fn format_one(n: u64, token: &str, grouping_separator: Option<char>, grouping_size: Option<u32>) -> String {
    if token.chars().all(|c| c == '0' || c == '1') && !token.is_empty() {
        let width = token.len();
        let digits = n.to_string();
        let padded = if digits.len() < width {
            format!("{}{}", "0".repeat(width - digits.len()), digits)
        } else {
            digits
        };
        return group_digits(&padded, grouping_separator, grouping_size);
    }
    match token {
        "a" => to_alphabetic(n, false),
        "A" => to_alphabetic(n, true),
        "i" => to_roman(n).to_lowercase(),
        "I" => to_roman(n),
        _ => n.to_string(),
    }
}

fn group_digits(digits: &str, sep: Option<char>, size: Option<u32>) -> String {
    let (Some(sep), size) = (sep, size.unwrap_or(3).max(1) as usize) else {
        return digits.to_string();
    };
    let bytes: Vec<char> = digits.chars().collect();
    let mut out = String::new();
    for (i, c) in bytes.iter().enumerate() {
        let remaining = bytes.len() - i;
        if i != 0 && remaining % size == 0 {
            out.push(sep);
        }
        out.push(*c);
    }
    out
}

fn to_alphabetic(n: u64, upper: bool) -> String {
    let mut n = n;
    let mut letters = Vec::new();
    while n > 0 {
        n -= 1;
        letters.push((b'a' + (n % 26) as u8) as char);
        n /= 26;
    }
    letters.reverse();
    let s: String = letters.into_iter().collect();
    if upper { s.to_uppercase() } else { s }
}

fn to_roman(mut n: u64) -> String {
    const TABLE: &[(u64, &str)] = &[
        (1000, "M"), (900, "CM"), (500, "D"), (400, "CD"),
        (100, "C"), (90, "XC"), (50, "L"), (40, "XL"),
        (10, "X"), (9, "IX"), (5, "V"), (4, "IV"), (1, "I"),
    ];
    let mut out = String::new();
    for (value, symbol) in TABLE {
        while n >= *value {
            out.push_str(symbol);
            n -= value;
        }
    }
    out
}

fn split_format_tokens(format: &str) -> Vec<(String, String, String)> {
    let mut tokens = Vec::new();
    let mut chars = format.chars().peekable();
    loop {
        let mut prefix = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_alphanumeric() {
                break;
            }
            prefix.push(c);
            chars.next();
        }
        let mut token = String::new();
        while let Some(&c) = chars.peek() {
            if !c.is_alphanumeric() {
                break;
            }
            token.push(c);
            chars.next();
        }
        if token.is_empty() {
            if !tokens.is_empty() || !prefix.is_empty() {
                if let Some(last) = tokens.last_mut() {
                    let last: &mut (String, String, String) = last;
                    last.2.push_str(&prefix);
                }
            }
            break;
        }
        tokens.push((prefix, token, String::new()));
        if chars.peek().is_none() {
            break;
        }
    }
    if tokens.is_empty() {
        tokens.push((String::new(), "1".to_string(), String::new()));
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_decimal_with_padding() {
        assert_eq!(format_number_sequence(&[7.0], "001", None, None), "007");
    }

    #[test]
    fn formats_alphabetic_and_roman() {
        assert_eq!(format_number_sequence(&[1.0], "a", None, None), "a");
        assert_eq!(format_number_sequence(&[4.0], "I", None, None), "IV");
    }

    #[test]
    fn groups_thousands() {
        assert_eq!(format_number_sequence(&[1234567.0], "1", Some(','), Some(3)), "1,234,567");
    }

    #[test]
    fn multi_level_join_uses_format_separators() {
        assert_eq!(format_number_sequence(&[1.0, 2.0, 3.0], "1.1.1", None, None), "1.2.3");
    }
}
