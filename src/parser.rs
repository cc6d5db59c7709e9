use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use tree_sitter::{Language, Node, Parser};

/// A single extracted symbol, still in pre-order (parent rows precede their
/// children) so a persistence layer can assign ids and wire up
/// `parent_symbol_id` in one forward pass.
#[derive(Debug, Clone)]
pub struct ParsedSymbol {
    pub name: String,
    pub kind: String,
    pub line_start: u32,
    pub line_end: u32,
    /// Index into the same `ParseOutcome::symbols` vector, or `None` at the
    /// file's top level.
    pub parent_index: Option<usize>,
    pub source_text: String,
    pub signature: String,
}

#[derive(Debug, Clone)]
pub struct ParsedReference {
    pub name: String,
    pub line: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub language: Option<&'static str>,
    pub symbols: Vec<ParsedSymbol>,
    pub references: Vec<ParsedReference>,
}

const IDENTIFIER_KINDS: &[&str] = &[
    "identifier",
    "type_identifier",
    "property_identifier",
    "field_identifier",
    "constant",
    "name",
];

struct GrammarInfo {
    name: &'static str,
    language: Language,
}

fn build_registry() -> HashMap<&'static str, GrammarInfo> {
    let mut m = HashMap::new();
    m.insert("rs", GrammarInfo { name: "rust", language: tree_sitter_rust::language() });
    m.insert("py", GrammarInfo { name: "python", language: tree_sitter_python::language() });
    m.insert("ts", GrammarInfo { name: "typescript", language: tree_sitter_typescript::language_typescript() });
    m.insert("tsx", GrammarInfo { name: "typescript", language: tree_sitter_typescript::language_tsx() });
    m.insert("js", GrammarInfo { name: "typescript", language: tree_sitter_typescript::language_typescript() });
    m.insert("jsx", GrammarInfo { name: "typescript", language: tree_sitter_typescript::language_tsx() });

    #[cfg(feature = "lang-go")]
    m.insert("go", GrammarInfo { name: "go", language: tree_sitter_go::language() });

    #[cfg(feature = "lang-java")]
    m.insert("java", GrammarInfo { name: "java", language: tree_sitter_java::language() });

    #[cfg(feature = "lang-csharp")]
    m.insert("cs", GrammarInfo { name: "csharp", language: tree_sitter_c_sharp::language() });

    #[cfg(feature = "lang-php")]
    m.insert("php", GrammarInfo { name: "php", language: tree_sitter_php::LANGUAGE_PHP.into() });

    m
}

fn registry() -> &'static HashMap<&'static str, GrammarInfo> {
    static REG: OnceLock<HashMap<&'static str, GrammarInfo>> = OnceLock::new();
    REG.get_or_init(build_registry)
}

fn ext_lower(path: &Path) -> String {
    path.extension().and_then(|e| e.to_str()).unwrap_or("").to_ascii_lowercase()
}

pub fn is_known_source_extension(ext: &str) -> bool {
    registry().contains_key(ext)
}

/// Maps a grammar-specific CST node kind to a normalized (kind, is_container)
/// pair. `is_container` nodes (class-like, impl/trait blocks, interfaces,
/// modules) recurse to collect nested symbols; everything else does not.
fn classify_node(lang: &str, node_kind: &str) -> Option<(&'static str, bool)> {
    match (lang, node_kind) {
        ("rust", "function_item") => Some(("function", false)),
        ("rust", "impl_item") => Some(("class", true)),
        ("rust", "trait_item") => Some(("class", true)),
        ("rust", "struct_item") => Some(("class", true)),
        ("rust", "enum_item") => Some(("class", true)),
        ("rust", "mod_item") => Some(("class", true)),

        ("python", "function_definition") => Some(("function", false)),
        ("python", "class_definition") => Some(("class", true)),

        ("typescript", "function_declaration") => Some(("function", false)),
        ("typescript", "method_definition") => Some(("function", false)),
        ("typescript", "class_declaration") => Some(("class", true)),
        ("typescript", "interface_declaration") => Some(("class", true)),

        ("go", "function_declaration") => Some(("function", false)),
        ("go", "method_declaration") => Some(("function", false)),
        ("go", "type_declaration") => Some(("class", true)),

        ("java", "method_declaration") => Some(("function", false)),
        ("java", "constructor_declaration") => Some(("function", false)),
        ("java", "class_declaration") => Some(("class", true)),
        ("java", "interface_declaration") => Some(("class", true)),

        ("csharp", "method_declaration") => Some(("function", false)),
        ("csharp", "constructor_declaration") => Some(("function", false)),
        ("csharp", "class_declaration") => Some(("class", true)),
        ("csharp", "interface_declaration") => Some(("class", true)),

        ("php", "function_definition") => Some(("function", false)),
        ("php", "method_declaration") => Some(("function", false)),
        ("php", "class_declaration") => Some(("class", true)),
        ("php", "interface_declaration") => Some(("class", true)),

        _ => None,
    }
}

fn first_identifier_in_children(node: Node, source: &[u8]) -> Option<String> {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if IDENTIFIER_KINDS.contains(&child.kind()) {
            return node_text(child, source).ok();
        }
    }
    None
}

fn first_identifier_dfs(node: Node, source: &[u8]) -> Option<String> {
    if IDENTIFIER_KINDS.contains(&node.kind()) {
        return node_text(node, source).ok();
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if let Some(found) = first_identifier_dfs(child, source) {
            return Some(found);
        }
    }
    None
}

fn node_text(node: Node, source: &[u8]) -> Result<String, std::str::Utf8Error> {
    Ok(String::from_utf8_lossy(&source[node.start_byte()..node.end_byte()]).into_owned())
}

fn derive_name(node: Node, source: &[u8]) -> String {
    if let Some(name) = first_identifier_in_children(node, source) {
        return name;
    }
    if let Some(name) = first_identifier_dfs(node, source) {
        return name;
    }
    format!("<anonymous@{}>", node.start_position().row + 1)
}

fn derive_signature(source_text: &str) -> String {
    let first_line = source_text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    if first_line.chars().count() > 100 {
        let truncated: String = first_line.chars().take(100).collect();
        format!("{truncated}...")
    } else {
        first_line.to_string()
    }
}

/// TS/JS only: `const handler = () => {...}` declares a function-shaped
/// symbol the same way a `function_declaration` would, but the CST nests it
/// as `lexical_declaration > variable_declarator > arrow_function` rather
/// than handing back a single classifiable node. One statement may declare
/// several bindings (`const a = 1, b = () => {}`), so this walks every
/// `variable_declarator` child and emits one symbol per arrow-valued one.
fn arrow_function_declarators<'a>(lang: &str, node: Node<'a>) -> Vec<Node<'a>> {
    if lang != "typescript" || !matches!(node.kind(), "lexical_declaration" | "variable_declaration") {
        return vec![];
    }
    let mut cursor = node.walk();
    node.children(&mut cursor)
        .filter(|c| c.kind() == "variable_declarator")
        .filter(|d| d.child_by_field_name("value").map(|v| v.kind() == "arrow_function").unwrap_or(false))
        .collect()
}

fn walk_symbols(
    node: Node,
    source: &[u8],
    lang: &'static str,
    parent_index: Option<usize>,
    nearest_container_kind: Option<&'static str>,
    out: &mut Vec<ParsedSymbol>,
) {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        let arrow_declarators = arrow_function_declarators(lang, child);
        if !arrow_declarators.is_empty() {
            for declarator in arrow_declarators {
                let kind = if nearest_container_kind == Some("class") { "method" } else { "function" };
                let name = derive_name(declarator, source);
                let source_text = node_text(declarator, source).unwrap_or_default();
                let signature = derive_signature(&source_text);
                out.push(ParsedSymbol {
                    name,
                    kind: kind.to_string(),
                    line_start: declarator.start_position().row as u32 + 1,
                    line_end: declarator.end_position().row as u32 + 1,
                    parent_index,
                    source_text,
                    signature,
                });
            }
            continue;
        }

        if let Some((mut kind, is_container)) = classify_node(lang, child.kind()) {
            if kind == "function" && nearest_container_kind == Some("class") {
                kind = "method";
            }
            let name = derive_name(child, source);
            let source_text = node_text(child, source).unwrap_or_default();
            let signature = derive_signature(&source_text);
            out.push(ParsedSymbol {
                name,
                kind: kind.to_string(),
                line_start: child.start_position().row as u32 + 1,
                line_end: child.end_position().row as u32 + 1,
                parent_index,
                source_text,
                signature,
            });
            let this_index = out.len() - 1;
            if is_container {
                walk_symbols(child, source, lang, Some(this_index), Some("class"), out);
            }
        } else {
            walk_symbols(child, source, lang, parent_index, nearest_container_kind, out);
        }
    }
}

fn collect_references(node: Node, source: &[u8], out: &mut Vec<ParsedReference>) {
    if node.child_count() == 0 {
        if IDENTIFIER_KINDS.contains(&node.kind()) {
            if let Ok(name) = node_text(node, source) {
                out.push(ParsedReference { name, line: node.start_position().row as u32 + 1 });
            }
        }
        return;
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_references(child, source, out);
    }
}

fn dedup_references(mut refs: Vec<ParsedReference>) -> Vec<ParsedReference> {
    let mut seen = std::collections::HashSet::new();
    refs.retain(|r| seen.insert((r.name.clone(), r.line)));
    refs
}

const FALLBACK_SOURCE_CAP: usize = 4000;

fn fallback_outcome(path: &Path, content: &str) -> ParseOutcome {
    let basename = path.file_name().and_then(|n| n.to_str()).unwrap_or("file").to_string();
    let line_count = content.lines().count().max(1) as u32;
    let truncated: String = content.chars().take(FALLBACK_SOURCE_CAP).collect();
    ParseOutcome {
        language: None,
        symbols: vec![ParsedSymbol {
            name: basename,
            kind: "file".to_string(),
            line_start: 1,
            line_end: line_count,
            parent_index: None,
            signature: String::new(),
            source_text: truncated,
        }],
        references: vec![],
    }
}

/// Parses one source file and returns its symbol forest (pre-order) and a
/// flat, deduplicated reference list. Falls back to a single `kind="file"`
/// symbol when no grammar is registered for the extension, so every readable
/// file stays searchable by filename and dense similarity.
pub fn parse_source(path: &Path, content: &str) -> ParseOutcome {
    let ext = ext_lower(path);
    let Some(info) = registry().get(ext.as_str()) else {
        return fallback_outcome(path, content);
    };

    let mut parser = Parser::new();
    if parser.set_language(&info.language).is_err() {
        return fallback_outcome(path, content);
    }
    let Some(tree) = parser.parse(content, None) else {
        return fallback_outcome(path, content);
    };

    let source = content.as_bytes();
    let root = tree.root_node();

    let mut symbols = Vec::new();
    walk_symbols(root, source, info.name, None, None, &mut symbols);

    let mut references = Vec::new();
    collect_references(root, source, &mut references);
    let references = dedup_references(references);

    ParseOutcome { language: Some(info.name), symbols, references }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn python_method_is_promoted_and_parented() {
        let src = "class Foo:\n    def bar(self): pass\n";
        let outcome = parse_source(&PathBuf::from("x.py"), src);
        assert_eq!(outcome.symbols.len(), 2);
        let class_sym = &outcome.symbols[0];
        assert_eq!(class_sym.kind, "class");
        assert_eq!(class_sym.name, "Foo");
        let method_sym = &outcome.symbols[1];
        assert_eq!(method_sym.kind, "method");
        assert_eq!(method_sym.name, "bar");
        assert_eq!(method_sym.parent_index, Some(0));
        assert_eq!(method_sym.line_start, 2);
        assert!(method_sym.signature.starts_with("def bar"));
    }

    #[test]
    fn arrow_function_bound_to_const_is_a_function_symbol() {
        let src = "const handler = () => {\n    return 1;\n};\n";
        let outcome = parse_source(&PathBuf::from("a.ts"), src);
        assert_eq!(outcome.symbols.len(), 1);
        assert_eq!(outcome.symbols[0].kind, "function");
        assert_eq!(outcome.symbols[0].name, "handler");
    }

    #[test]
    fn top_level_function_has_no_parent() {
        let src = "def g():\n    return 1\n";
        let outcome = parse_source(&PathBuf::from("a.py"), src);
        assert_eq!(outcome.symbols.len(), 1);
        assert_eq!(outcome.symbols[0].kind, "function");
        assert!(outcome.symbols[0].parent_index.is_none());
    }

    #[test]
    fn unknown_extension_falls_back_to_file_symbol() {
        let outcome = parse_source(&PathBuf::from("notes.txt"), "hello\nworld\n");
        assert_eq!(outcome.symbols.len(), 1);
        assert_eq!(outcome.symbols[0].kind, "file");
        assert_eq!(outcome.symbols[0].name, "notes.txt");
    }

    #[test]
    fn references_are_deduplicated() {
        let src = "def g():\n    return g\n";
        let outcome = parse_source(&PathBuf::from("a.py"), src);
        let g_refs: Vec<_> = outcome.references.iter().filter(|r| r.name == "g").collect();
        assert!(!g_refs.is_empty());
        let mut seen = std::collections::HashSet::new();
        for r in &outcome.references {
            assert!(seen.insert((r.name.clone(), r.line)));
        }
    }
}
