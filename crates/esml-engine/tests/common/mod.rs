//! Shared fixtures: an in-memory transport and a tiny script host that
//! evaluates rewritten module bodies for the JavaScript subset used here.

#![allow(dead_code)]

use async_trait::async_trait;
use esml_engine::{
    ContentCache, DYNAMIC_IMPORT_PARAM, EngineError, EngineResult, ExecutionContext, ExportValue,
    Exports, FACTORY_PARAMS, FetchedSource, HostError, HostResult, IMPORTS_PARAM, LoaderConfig,
    ModuleGraphLoader, ModuleHost, ModuleView, SELF_PARAM, Transport,
};
use oxc_allocator::Allocator;
use oxc_ast::ast::*;
use oxc_ast_visit::{Visit, walk};
use oxc_parser::Parser;
use oxc_span::{GetSpan, SourceType};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::watch;
use url::Url;

pub const BASE: &str = "https://example.test/app/";

pub fn base() -> Url {
    Url::parse(BASE).unwrap()
}

/// Absolute id of a path under the test base
pub fn id(path: &str) -> String {
    base().join(path).unwrap().to_string()
}

pub fn config() -> LoaderConfig {
    LoaderConfig::with_base(base())
}

pub fn loader(transport: &Arc<MemoryTransport>, host: &Arc<ScriptHost>) -> ModuleGraphLoader {
    loader_with(config(), transport, host, None)
}

pub fn loader_with(
    config: LoaderConfig,
    transport: &Arc<MemoryTransport>,
    host: &Arc<ScriptHost>,
    cache: Option<Arc<dyn ContentCache>>,
) -> ModuleGraphLoader {
    let mut builder = ModuleGraphLoader::builder(config, host.clone()).transport(transport.clone());
    if let Some(cache) = cache {
        builder = builder.cache(cache);
    }
    builder.build().unwrap()
}

/// Plain data export of a module
pub fn data(view: &ModuleView, key: &str) -> Option<serde_json::Value> {
    view.get(key).and_then(|value| value.as_data().cloned())
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// url -> source, with per-url fetch counters, a release gate and
/// per-module holds
pub struct MemoryTransport {
    files: Mutex<HashMap<String, FetchedSource>>,
    fetches: Mutex<HashMap<String, usize>>,
    gate: watch::Sender<bool>,
    held: watch::Sender<HashSet<String>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            fetches: Mutex::new(HashMap::new()),
            gate: watch::channel(true).0,
            held: watch::channel(HashSet::new()).0,
        }
    }

    /// Fetches block until [`MemoryTransport::open`] is called
    pub fn gated() -> Self {
        let transport = Self::new();
        transport.gate.send_replace(false);
        transport
    }

    pub fn with_module(self, path: &str, source: &str) -> Self {
        self.insert(path, source);
        self
    }

    /// Add or replace a JavaScript module under the test base
    pub fn insert(&self, path: &str, source: &str) {
        self.insert_typed(path, "text/javascript; charset=utf-8", source);
    }

    pub fn insert_typed(&self, path: &str, content_type: &str, body: &str) {
        self.files.lock().insert(
            id(path),
            FetchedSource::new(content_type, body.as_bytes().to_vec()),
        );
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    /// Fetches of `path` block until [`MemoryTransport::release`]
    pub fn hold(&self, path: &str) {
        self.held.send_modify(|held| {
            held.insert(id(path));
        });
    }

    pub fn release(&self, path: &str) {
        self.held.send_modify(|held| {
            held.remove(&id(path));
        });
    }

    pub fn fetch_count(&self, path: &str) -> usize {
        self.fetches.lock().get(&id(path)).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.fetches.lock().values().sum()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn fetch(&self, url: &Url) -> EngineResult<FetchedSource> {
        *self.fetches.lock().entry(url.to_string()).or_default() += 1;

        let mut gate = self.gate.subscribe();
        gate.wait_for(|open| *open)
            .await
            .map_err(|e| EngineError::fetch(url.as_str(), e))?;

        let mut held = self.held.subscribe();
        held.wait_for(|held| !held.contains(url.as_str()))
            .await
            .map_err(|e| EngineError::fetch(url.as_str(), e))?;

        self.files
            .lock()
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| EngineError::fetch(url.as_str(), "HTTP 404 Not Found"))
    }
}

// ---------------------------------------------------------------------------
// Script host
// ---------------------------------------------------------------------------

/// Evaluates rewritten bodies: literals, `+ - *`, member access, object
/// literals with spread, `const`/`let` with object destructuring,
/// function/class declarations (as opaque values), `throw`,
/// `await __import__("lit")` and fire-and-forget `__import__("lit");`
/// statements.
#[derive(Default)]
pub struct ScriptHost {
    executed: Mutex<Vec<String>>,
    executions: AtomicUsize,
}

impl ScriptHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Module ids in execution order
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    pub fn position(&self, path: &str) -> Option<usize> {
        let target = id(path);
        self.executed.lock().iter().position(|id| *id == target)
    }
}

#[async_trait]
impl ModuleHost for ScriptHost {
    async fn execute(&self, body: &str, ctx: ExecutionContext) -> HostResult<Exports> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.executed.lock().push(ctx.module.id().to_string());

        let specifiers = dynamic_specifiers(body)?;

        // Detached imports run on their own; nobody waits for them.
        for specifier in specifiers.detached {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let _ = ctx.import(&specifier).await;
            });
        }

        // Awaited imports are settled before evaluation starts.
        let mut dynamic = HashMap::new();
        for specifier in specifiers.awaited {
            let view = ctx
                .import(&specifier)
                .await
                .map_err(|e| HostError::new(e.to_string()))?;
            dynamic.insert(specifier, view);
        }

        evaluate(body, &ctx, &dynamic)
    }
}

fn wrap(body: &str) -> String {
    format!(
        "async function __module__({}) {{\n{}\n}}",
        FACTORY_PARAMS.join(", "),
        body
    )
}

fn dynamic_specifiers(body: &str) -> HostResult<DynamicImportCollector> {
    let source = wrap(body);
    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, &source, SourceType::mjs()).parse();
    if let Some(error) = ret.errors.first() {
        return Err(HostError::new(format!("SyntaxError: {}", error)));
    }

    let mut collector = DynamicImportCollector::default();
    collector.visit_program(&ret.program);
    Ok(collector)
}

#[derive(Default)]
struct DynamicImportCollector {
    awaited: Vec<String>,
    detached: Vec<String>,
}

impl<'a> Visit<'a> for DynamicImportCollector {
    fn visit_expression_statement(&mut self, it: &ExpressionStatement<'a>) {
        if let Some(specifier) = detached_import(it) {
            if !self.detached.contains(&specifier) {
                self.detached.push(specifier);
            }
            return;
        }
        walk::walk_expression_statement(self, it);
    }

    fn visit_call_expression(&mut self, it: &CallExpression<'a>) {
        if let Some(specifier) = dynamic_import_specifier(it) {
            if !self.awaited.contains(&specifier) {
                self.awaited.push(specifier);
            }
        }
        walk::walk_call_expression(self, it);
    }
}

/// `__import__("lit");` used as a statement
fn detached_import(stmt: &ExpressionStatement<'_>) -> Option<String> {
    match &stmt.expression {
        Expression::CallExpression(call) => dynamic_import_specifier(call),
        _ => None,
    }
}

fn dynamic_import_specifier(call: &CallExpression<'_>) -> Option<String> {
    match &call.callee {
        Expression::Identifier(callee) if callee.name.as_str() == DYNAMIC_IMPORT_PARAM => {}
        _ => return None,
    }
    match call.arguments.first().and_then(|arg| arg.as_expression()) {
        Some(Expression::StringLiteral(lit)) => Some(lit.value.to_string()),
        _ => None,
    }
}

fn evaluate(
    body: &str,
    ctx: &ExecutionContext,
    dynamic: &HashMap<String, ModuleView>,
) -> HostResult<Exports> {
    let source = wrap(body);
    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, &source, SourceType::mjs()).parse();
    if let Some(error) = ret.errors.first() {
        return Err(HostError::new(format!("SyntaxError: {}", error)));
    }

    let Some(Statement::FunctionDeclaration(func)) = ret.program.body.first() else {
        return Err(HostError::new("wrapper function missing"));
    };
    let Some(function_body) = &func.body else {
        return Err(HostError::new("wrapper function has no body"));
    };

    let mut interp = Interpreter {
        source: &source,
        ctx,
        dynamic,
        env: HashMap::new(),
    };
    interp.env.insert(IMPORTS_PARAM.to_string(), Value::Imports);
    interp
        .env
        .insert(SELF_PARAM.to_string(), Value::Module(ctx.module.clone()));

    for stmt in &function_body.statements {
        if let Some(returned) = interp.exec(stmt)? {
            return into_exports(returned);
        }
    }
    Ok(Exports::new())
}

#[derive(Clone, Debug)]
enum Value {
    Undefined,
    Data(serde_json::Value),
    Module(ModuleView),
    Imports,
    Object(BTreeMap<String, Value>),
    Opaque(esml_engine::HostHandle),
    Function(String),
}

struct Interpreter<'s> {
    source: &'s str,
    ctx: &'s ExecutionContext,
    dynamic: &'s HashMap<String, ModuleView>,
    env: HashMap<String, Value>,
}

impl<'s> Interpreter<'s> {
    fn exec(&mut self, stmt: &Statement<'_>) -> HostResult<Option<Value>> {
        match stmt {
            Statement::VariableDeclaration(decl) => {
                for declarator in &decl.declarations {
                    let value = match &declarator.init {
                        Some(init) => self.eval(init)?,
                        None => Value::Undefined,
                    };
                    self.bind(&declarator.id, value)?;
                }
                Ok(None)
            }
            Statement::FunctionDeclaration(func) => {
                if let Some(id) = &func.id {
                    self.env
                        .insert(id.name.to_string(), Value::Function(id.name.to_string()));
                }
                Ok(None)
            }
            Statement::ClassDeclaration(class) => {
                if let Some(id) = &class.id {
                    self.env
                        .insert(id.name.to_string(), Value::Function(id.name.to_string()));
                }
                Ok(None)
            }
            Statement::ExpressionStatement(stmt) => {
                if detached_import(stmt).is_none() {
                    self.eval(&stmt.expression)?;
                }
                Ok(None)
            }
            Statement::ReturnStatement(ret) => match &ret.argument {
                Some(argument) => Ok(Some(self.eval(argument)?)),
                None => Ok(Some(Value::Undefined)),
            },
            Statement::ThrowStatement(throw) => Err(HostError::new(self.thrown(&throw.argument))),
            Statement::EmptyStatement(_) => Ok(None),
            other => Err(HostError::new(format!(
                "unsupported statement: {}",
                self.slice(other.span())
            ))),
        }
    }

    fn bind(&mut self, pattern: &BindingPattern<'_>, value: Value) -> HostResult<()> {
        match pattern {
            BindingPattern::BindingIdentifier(ident) => {
                self.env.insert(ident.name.to_string(), value);
                Ok(())
            }
            BindingPattern::ObjectPattern(object) => {
                for property in &object.properties {
                    let key = self.key(&property.key)?;
                    let field = self.property(&value, &key);
                    self.bind(&property.value, field)?;
                }
                if object.rest.is_some() {
                    return Err(HostError::new("object rest patterns are not supported"));
                }
                Ok(())
            }
            BindingPattern::AssignmentPattern(assign) => {
                let value = match value {
                    Value::Undefined => self.eval(&assign.right)?,
                    other => other,
                };
                self.bind(&assign.left, value)
            }
            BindingPattern::ArrayPattern(_) => {
                Err(HostError::new("array patterns are not supported"))
            }
        }
    }

    fn eval(&mut self, expr: &Expression<'_>) -> HostResult<Value> {
        match expr {
            Expression::NumericLiteral(lit) => Ok(Value::Data(number(lit.value))),
            Expression::StringLiteral(lit) => Ok(Value::Data(json!(lit.value.as_str()))),
            Expression::BooleanLiteral(lit) => Ok(Value::Data(json!(lit.value))),
            Expression::NullLiteral(_) => Ok(Value::Data(serde_json::Value::Null)),
            Expression::Identifier(ident) => {
                if ident.name.as_str() == "undefined" {
                    return Ok(Value::Undefined);
                }
                self.env
                    .get(ident.name.as_str())
                    .cloned()
                    .ok_or_else(|| {
                        HostError::new(format!("ReferenceError: {} is not defined", ident.name))
                    })
            }
            Expression::ParenthesizedExpression(paren) => self.eval(&paren.expression),
            Expression::AwaitExpression(await_expr) => self.eval(&await_expr.argument),
            Expression::BinaryExpression(binary) => {
                let left = self.eval(&binary.left)?;
                let right = self.eval(&binary.right)?;
                binary_op(binary.operator, left, right)
            }
            Expression::StaticMemberExpression(member) => {
                let object = self.eval(&member.object)?;
                Ok(self.property(&object, &member.property.name))
            }
            Expression::ComputedMemberExpression(member) => {
                let object = self.eval(&member.object)?;
                let key = match self.eval(&member.expression)? {
                    Value::Data(serde_json::Value::String(key)) => key,
                    Value::Data(serde_json::Value::Number(n)) => n.to_string(),
                    _ => return Err(HostError::new("unsupported computed key")),
                };
                Ok(self.property(&object, &key))
            }
            Expression::ObjectExpression(object) => {
                let mut fields = BTreeMap::new();
                for property in &object.properties {
                    match property {
                        ObjectPropertyKind::ObjectProperty(prop) => {
                            let key = self.key(&prop.key)?;
                            let value = self.eval(&prop.value)?;
                            fields.insert(key, value);
                        }
                        ObjectPropertyKind::SpreadProperty(spread) => {
                            let value = self.eval(&spread.argument)?;
                            fields.extend(self.entries(&value));
                        }
                    }
                }
                Ok(Value::Object(fields))
            }
            Expression::FunctionExpression(func) => Ok(Value::Function(
                func.id
                    .as_ref()
                    .map(|id| id.name.to_string())
                    .unwrap_or_else(|| "anonymous".into()),
            )),
            Expression::ClassExpression(class) => Ok(Value::Function(
                class
                    .id
                    .as_ref()
                    .map(|id| id.name.to_string())
                    .unwrap_or_else(|| "anonymous".into()),
            )),
            Expression::ArrowFunctionExpression(_) => Ok(Value::Function("arrow".into())),
            Expression::CallExpression(call) => match dynamic_import_specifier(call) {
                Some(specifier) => self
                    .dynamic
                    .get(&specifier)
                    .cloned()
                    .map(Value::Module)
                    .ok_or_else(|| HostError::new(format!("import '{}' not settled", specifier))),
                None => Err(HostError::new(format!(
                    "unsupported call: {}",
                    self.slice(call.span)
                ))),
            },
            other => Err(HostError::new(format!(
                "unsupported expression: {}",
                self.slice(other.span())
            ))),
        }
    }

    fn key(&mut self, key: &PropertyKey<'_>) -> HostResult<String> {
        match key {
            PropertyKey::StaticIdentifier(ident) => Ok(ident.name.to_string()),
            PropertyKey::StringLiteral(lit) => Ok(lit.value.to_string()),
            PropertyKey::NumericLiteral(lit) => Ok(number(lit.value).to_string()),
            _ => Err(HostError::new("unsupported property key")),
        }
    }

    fn property(&self, object: &Value, key: &str) -> Value {
        match object {
            Value::Imports => self
                .ctx
                .imports
                .get(key)
                .cloned()
                .map(Value::Module)
                .unwrap_or(Value::Undefined),
            Value::Module(view) => view.get(key).map(from_export).unwrap_or(Value::Undefined),
            Value::Object(fields) => fields.get(key).cloned().unwrap_or(Value::Undefined),
            Value::Data(serde_json::Value::Object(fields)) => fields
                .get(key)
                .cloned()
                .map(Value::Data)
                .unwrap_or(Value::Undefined),
            _ => Value::Undefined,
        }
    }

    fn entries(&self, value: &Value) -> Vec<(String, Value)> {
        match value {
            Value::Module(view) => view
                .exports()
                .unwrap_or_default()
                .into_iter()
                .map(|(key, value)| (key, from_export(value)))
                .collect(),
            Value::Object(fields) => fields
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            Value::Data(serde_json::Value::Object(fields)) => fields
                .iter()
                .map(|(key, value)| (key.clone(), Value::Data(value.clone())))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn thrown(&self, argument: &Expression<'_>) -> String {
        match argument {
            Expression::StringLiteral(lit) => lit.value.to_string(),
            Expression::NewExpression(new) => {
                let class = match &new.callee {
                    Expression::Identifier(ident) => ident.name.to_string(),
                    _ => "Error".to_string(),
                };
                match new.arguments.first().and_then(|arg| arg.as_expression()) {
                    Some(Expression::StringLiteral(lit)) => format!("{}: {}", class, lit.value),
                    _ => class,
                }
            }
            other => self.slice(other.span()).to_string(),
        }
    }

    fn slice(&self, span: oxc_span::Span) -> &str {
        &self.source[span.start as usize..span.end as usize]
    }
}

fn number(value: f64) -> serde_json::Value {
    if value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
        json!(value as i64)
    } else {
        json!(value)
    }
}

fn binary_op(operator: BinaryOperator, left: Value, right: Value) -> HostResult<Value> {
    let as_f64 = |value: &Value| match value {
        Value::Data(serde_json::Value::Number(n)) => n.as_f64(),
        _ => None,
    };

    match operator {
        BinaryOperator::Addition => match (&left, &right) {
            (Value::Data(serde_json::Value::String(l)), r) => {
                Ok(Value::Data(json!(format!("{}{}", l, display(r)))))
            }
            (l, Value::Data(serde_json::Value::String(r))) => {
                Ok(Value::Data(json!(format!("{}{}", display(l), r))))
            }
            _ => match (as_f64(&left), as_f64(&right)) {
                (Some(l), Some(r)) => Ok(Value::Data(number(l + r))),
                _ => Err(HostError::new("TypeError: unsupported operands for +")),
            },
        },
        BinaryOperator::Subtraction | BinaryOperator::Multiplication => {
            match (as_f64(&left), as_f64(&right)) {
                (Some(l), Some(r)) if operator == BinaryOperator::Subtraction => {
                    Ok(Value::Data(number(l - r)))
                }
                (Some(l), Some(r)) => Ok(Value::Data(number(l * r))),
                _ => Err(HostError::new("TypeError: non-numeric operands")),
            }
        }
        _ => Err(HostError::new("unsupported operator")),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::Undefined => "undefined".into(),
        Value::Data(serde_json::Value::String(s)) => s.clone(),
        Value::Data(other) => other.to_string(),
        Value::Module(_) | Value::Imports | Value::Object(_) => "[object Object]".into(),
        Value::Opaque(_) | Value::Function(_) => "function".into(),
    }
}

fn from_export(value: ExportValue) -> Value {
    match value {
        ExportValue::Data(data) => Value::Data(data),
        ExportValue::Namespace(view) => Value::Module(view),
        ExportValue::Opaque(handle) => Value::Opaque(handle),
    }
}

fn into_export(value: Value) -> ExportValue {
    match value {
        Value::Undefined => ExportValue::Data(serde_json::Value::Null),
        Value::Data(data) => ExportValue::Data(data),
        Value::Module(view) => ExportValue::Namespace(view),
        Value::Opaque(handle) => ExportValue::Opaque(handle),
        Value::Function(name) => ExportValue::Opaque(Arc::new(name)),
        Value::Imports => ExportValue::Data(serde_json::Value::Null),
        Value::Object(fields) => ExportValue::Data(to_json(fields)),
    }
}

fn to_json(fields: BTreeMap<String, Value>) -> serde_json::Value {
    let object = fields
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::Data(data) => data,
                Value::Object(nested) => to_json(nested),
                _ => serde_json::Value::Null,
            };
            (key, value)
        })
        .collect();
    serde_json::Value::Object(object)
}

fn into_exports(value: Value) -> HostResult<Exports> {
    match value {
        Value::Object(fields) => Ok(fields
            .into_iter()
            .map(|(key, value)| (key, into_export(value)))
            .collect()),
        Value::Module(view) => Ok(view.exports().unwrap_or_default()),
        _ => Err(HostError::new("module body must return an object")),
    }
}
