//! Import/export rewrite into a dependency-injection factory body.
//!
//! The module is parsed with oxc, its top-level import and export
//! declarations are recorded, and the declaration syntax is cut out of the
//! original text by byte span. Declarations and expressions wrapped by
//! `export` stay where they are. The result is a function body taking
//! `(__imports__, __self__, __import__)`:
//!
//! ```text
//! "use strict";
//! const {
//!     "x": x
//! } = __imports__["./a.js"];
//! export-free original body
//! return {
//!     "y": y
//! };
//! ```
//!
//! Spans come from the AST, so comments and string contents never shift
//! a cut.

use crate::error::{EngineError, EngineResult};
use oxc_allocator::Allocator;
use oxc_ast::ast::*;
use oxc_ast_visit::{Visit, walk};
use oxc_parser::Parser;
use oxc_span::{GetSpan, SourceType, Span};
use serde::{Deserialize, Serialize};

/// Parameter holding the dependency map (specifier -> module)
pub const IMPORTS_PARAM: &str = "__imports__";
/// Parameter holding the module's own view
pub const SELF_PARAM: &str = "__self__";
/// Parameter holding the dynamic `import()` function bound to this module
pub const DYNAMIC_IMPORT_PARAM: &str = "__import__";
/// Local binding synthesized for anonymous default exports
pub const DEFAULT_EXPORT_LOCAL: &str = "__default__";
/// Factory parameters, in order
pub const FACTORY_PARAMS: [&str; 3] = [IMPORTS_PARAM, SELF_PARAM, DYNAMIC_IMPORT_PARAM];

const DEFAULT_EXPORT_PREFIX: &str = "const __default__ = ";
const DYNAMIC_IMPORT_KEYWORD: &str = "import";

/// Rewritten module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformOutput {
    /// Executable factory body
    pub text: String,
    /// Static dependency specifiers, first-seen order, no duplicates
    pub dependencies: Vec<String>,
}

/// Transform raw module bytes.
pub fn transform(source: &[u8]) -> EngineResult<TransformOutput> {
    let text = std::str::from_utf8(source)
        .map_err(|e| EngineError::syntax(format!("module source is not valid UTF-8: {}", e)))?;
    transform_source(text)
}

/// Transform module source text.
pub fn transform_source(source: &str) -> EngineResult<TransformOutput> {
    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, source, SourceType::mjs()).parse();

    if let Some(error) = ret.errors.first() {
        return Err(EngineError::syntax(error.to_string()));
    }
    if ret.panicked {
        return Err(EngineError::syntax("parser aborted"));
    }

    let program = ret.program;
    let mut surface = ModuleSurface::default();

    if let Some(hashbang) = &program.hashbang {
        surface.remove(hashbang.span);
    }

    for stmt in &program.body {
        surface.collect(stmt)?;
    }

    let mut dynamic = DynamicImports::default();
    dynamic.visit_program(&program);
    if let Some(span) = dynamic.import_meta {
        return Err(EngineError::syntax(format!(
            "`import.meta` at offset {} has no equivalent in a module body",
            span.start
        )));
    }
    surface.patches.append(&mut dynamic.patches);

    Ok(surface.emit(source))
}

/// Text edit over the original source
#[derive(Debug)]
struct Patch {
    span: Span,
    replacement: &'static str,
}

/// Static import/export surface of one module
#[derive(Debug, Default)]
struct ModuleSurface {
    /// specifier -> (imported, local), grouped per specifier
    imports: Vec<(String, Vec<(String, String)>)>,
    /// (local, specifier)
    namespace_imports: Vec<(String, String)>,
    /// (exported, local)
    local_exports: Vec<(String, String)>,
    /// (exported, specifier, imported)
    reexports: Vec<(String, String, String)>,
    /// (exported, specifier)
    namespace_exports: Vec<(String, String)>,
    /// `export * from` specifiers
    spread_exports: Vec<String>,
    dependencies: Vec<String>,
    patches: Vec<Patch>,
}

impl ModuleSurface {
    fn collect(&mut self, stmt: &Statement<'_>) -> EngineResult<()> {
        match stmt {
            Statement::ImportDeclaration(decl) => {
                self.collect_import(decl);
                Ok(())
            }
            Statement::ExportNamedDeclaration(decl) => self.collect_export_named(decl),
            Statement::ExportDefaultDeclaration(decl) => self.collect_export_default(decl),
            Statement::ExportAllDeclaration(decl) => {
                self.collect_export_all(decl);
                Ok(())
            }
            Statement::TSExportAssignment(_) => Err(EngineError::syntax("`export =` assignment")),
            Statement::TSNamespaceExportDeclaration(_) => {
                Err(EngineError::syntax("`export as namespace` declaration"))
            }
            Statement::TSImportEqualsDeclaration(_) => {
                Err(EngineError::syntax("`import x = require()` declaration"))
            }
            _ => Ok(()),
        }
    }

    /// import d, { a, b as c } from "x" / import * as ns from "x" / import "x"
    fn collect_import(&mut self, decl: &ImportDeclaration<'_>) {
        let specifier = decl.source.value.to_string();
        self.depend(&specifier);
        self.remove(decl.span);

        let Some(specifiers) = &decl.specifiers else {
            return;
        };
        for spec in specifiers {
            match spec {
                ImportDeclarationSpecifier::ImportSpecifier(s) => {
                    self.bind_import(&specifier, s.imported.name().to_string(), &s.local.name);
                }
                ImportDeclarationSpecifier::ImportDefaultSpecifier(s) => {
                    self.bind_import(&specifier, "default".to_string(), &s.local.name);
                }
                ImportDeclarationSpecifier::ImportNamespaceSpecifier(s) => {
                    self.namespace_imports
                        .push((s.local.name.to_string(), specifier.clone()));
                }
            }
        }
    }

    /// export { a, b as c } / export { a } from "x" / export <declaration>
    fn collect_export_named(&mut self, decl: &ExportNamedDeclaration<'_>) -> EngineResult<()> {
        if let Some(source) = &decl.source {
            let specifier = source.value.to_string();
            self.depend(&specifier);
            for spec in &decl.specifiers {
                self.reexports.push((
                    spec.exported.name().to_string(),
                    specifier.clone(),
                    spec.local.name().to_string(),
                ));
            }
            self.remove(decl.span);
            return Ok(());
        }

        let Some(declaration) = &decl.declaration else {
            for spec in &decl.specifiers {
                self.local_exports
                    .push((spec.exported.name().to_string(), spec.local.name().to_string()));
            }
            self.remove(decl.span);
            return Ok(());
        };

        // Only the `export` keyword goes; the declaration stays.
        self.remove(Span::new(decl.span.start, declaration.span().start));

        let mut names = Vec::new();
        match declaration {
            Declaration::VariableDeclaration(var) => {
                for declarator in &var.declarations {
                    collect_binding_names(&declarator.id, &mut names);
                }
            }
            Declaration::FunctionDeclaration(func) => match &func.id {
                Some(id) => names.push(id.name.to_string()),
                None => return Err(EngineError::syntax("exported function without a name")),
            },
            Declaration::ClassDeclaration(class) => match &class.id {
                Some(id) => names.push(id.name.to_string()),
                None => return Err(EngineError::syntax("exported class without a name")),
            },
            _ => return Err(EngineError::syntax("unsupported exported declaration")),
        }

        for name in names {
            self.local_exports.push((name.clone(), name));
        }
        Ok(())
    }

    /// export default <declaration | expression>
    fn collect_export_default(&mut self, decl: &ExportDefaultDeclaration<'_>) -> EngineResult<()> {
        let keywords = Span::new(decl.span.start, decl.declaration.span().start);

        let name = match &decl.declaration {
            ExportDefaultDeclarationKind::FunctionDeclaration(func) => {
                func.id.as_ref().map(|id| id.name.to_string())
            }
            ExportDefaultDeclarationKind::ClassDeclaration(class) => {
                class.id.as_ref().map(|id| id.name.to_string())
            }
            ExportDefaultDeclarationKind::TSInterfaceDeclaration(_) => {
                return Err(EngineError::syntax("`export default interface` declaration"));
            }
            _ => None,
        };

        match name {
            Some(name) => {
                self.remove(keywords);
                self.local_exports.push(("default".to_string(), name));
            }
            None => {
                self.patches.push(Patch {
                    span: keywords,
                    replacement: DEFAULT_EXPORT_PREFIX,
                });
                self.local_exports
                    .push(("default".to_string(), DEFAULT_EXPORT_LOCAL.to_string()));
            }
        }
        Ok(())
    }

    /// export * from "x" / export * as ns from "x"
    fn collect_export_all(&mut self, decl: &ExportAllDeclaration<'_>) {
        let specifier = decl.source.value.to_string();
        self.depend(&specifier);
        self.remove(decl.span);

        match &decl.exported {
            Some(exported) => self
                .namespace_exports
                .push((exported.name().to_string(), specifier)),
            None => self.spread_exports.push(specifier),
        }
    }

    fn bind_import(&mut self, specifier: &str, imported: String, local: &str) {
        let index = match self.imports.iter().position(|(s, _)| s == specifier) {
            Some(index) => index,
            None => {
                self.imports.push((specifier.to_string(), Vec::new()));
                self.imports.len() - 1
            }
        };
        self.imports[index].1.push((imported, local.to_string()));
    }

    fn depend(&mut self, specifier: &str) {
        if !self.dependencies.iter().any(|d| d == specifier) {
            self.dependencies.push(specifier.to_string());
        }
    }

    fn remove(&mut self, span: Span) {
        self.patches.push(Patch {
            span,
            replacement: "",
        });
    }

    fn emit(mut self, source: &str) -> TransformOutput {
        self.patches.sort_by_key(|p| (p.span.start, p.span.end));

        let mut body = String::with_capacity(source.len());
        let mut cursor = 0usize;
        for patch in &self.patches {
            let start = patch.span.start as usize;
            // Nested inside an already removed range
            if start < cursor {
                continue;
            }
            body.push_str(&source[cursor..start]);
            body.push_str(patch.replacement);
            cursor = patch.span.end as usize;
        }
        body.push_str(&source[cursor..]);

        let mut text = String::with_capacity(body.len() + 256);
        text.push_str("\"use strict\";\n");

        for (specifier, bindings) in &self.imports {
            let fields: Vec<String> = bindings
                .iter()
                .map(|(imported, local)| format!("{}: {}", quote(imported), local))
                .collect();
            text.push_str(&format!(
                "const {{\n    {}\n}} = {}[{}];\n",
                fields.join(",\n    "),
                IMPORTS_PARAM,
                quote(specifier)
            ));
        }
        for (local, specifier) in &self.namespace_imports {
            text.push_str(&format!(
                "const {} = {}[{}];\n",
                local,
                IMPORTS_PARAM,
                quote(specifier)
            ));
        }

        let body = body.trim();
        if !body.is_empty() {
            text.push_str(body);
            text.push('\n');
        }

        // Star exports first so explicit exports win on collisions.
        let mut fields = Vec::new();
        for specifier in &self.spread_exports {
            fields.push(format!("...({}[{}])", IMPORTS_PARAM, quote(specifier)));
        }
        for (exported, local) in &self.local_exports {
            fields.push(format!("{}: {}", quote(exported), local));
        }
        for (exported, specifier, imported) in &self.reexports {
            fields.push(format!(
                "{}: {}[{}][{}]",
                quote(exported),
                IMPORTS_PARAM,
                quote(specifier),
                quote(imported)
            ));
        }
        for (exported, specifier) in &self.namespace_exports {
            fields.push(format!(
                "{}: {}[{}]",
                quote(exported),
                IMPORTS_PARAM,
                quote(specifier)
            ));
        }

        if fields.is_empty() {
            text.push_str("return {};");
        } else {
            text.push_str(&format!("return {{\n    {}\n}};", fields.join(",\n    ")));
        }

        TransformOutput {
            text,
            dependencies: self.dependencies,
        }
    }
}

/// Collect every name bound by a (possibly destructuring) pattern
fn collect_binding_names(pattern: &BindingPattern<'_>, names: &mut Vec<String>) {
    match pattern {
        BindingPattern::BindingIdentifier(ident) => names.push(ident.name.to_string()),
        BindingPattern::ObjectPattern(object) => {
            for property in &object.properties {
                collect_binding_names(&property.value, names);
            }
            if let Some(rest) = &object.rest {
                collect_binding_names(&rest.argument, names);
            }
        }
        BindingPattern::ArrayPattern(array) => {
            for element in array.elements.iter().flatten() {
                collect_binding_names(element, names);
            }
            if let Some(rest) = &array.rest {
                collect_binding_names(&rest.argument, names);
            }
        }
        BindingPattern::AssignmentPattern(assign) => collect_binding_names(&assign.left, names),
    }
}

/// Rewrites `import(...)` to `__import__(...)` anywhere in the program
/// and spots `import.meta`, which cannot survive the rewrite.
#[derive(Default)]
struct DynamicImports {
    patches: Vec<Patch>,
    import_meta: Option<Span>,
}

impl<'a> Visit<'a> for DynamicImports {
    fn visit_import_expression(&mut self, it: &ImportExpression<'a>) {
        let keyword_end = it.span.start + DYNAMIC_IMPORT_KEYWORD.len() as u32;
        self.patches.push(Patch {
            span: Span::new(it.span.start, keyword_end),
            replacement: DYNAMIC_IMPORT_PARAM,
        });
        walk::walk_import_expression(self, it);
    }

    fn visit_meta_property(&mut self, it: &MetaProperty<'a>) {
        if it.meta.name.as_str() == DYNAMIC_IMPORT_KEYWORD && self.import_meta.is_none() {
            self.import_meta = Some(it.span);
        }
    }
}

/// Double-quoted JavaScript string literal
fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
