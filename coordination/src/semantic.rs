//! Semantic Analyzer: diffs a file's baseline and task-modified text into
//! typed, addressable edits instead of raw line diffs.
//!
//! New code built on the crate's own tree-sitter dependency set (the
//! teacher's `context_packer/` module walks ASTs for prompt packing, not
//! diffing, so the walking logic here is original, using the same parser
//! crates for the same two representative languages: Rust as the typed
//! language, Python as the dynamic one).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

fn hash_body(body: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    body.hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticChangeKind {
    AddFunction,
    ModifyFunction,
    RemoveFunction,
    AddImport,
    RemoveImport,
    AddClass,
    ModifyClass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticChange {
    pub kind: SemanticChangeKind,
    pub target: String,
    pub line_start: u32,
    pub line_end: u32,
    /// Hash of the entity's body text at the time of this change, when the
    /// change carries a body (add/modify of a function or class). Lets the
    /// merge conflict detector tell a byte-identical duplicate add from a
    /// genuine collision without re-reading source files.
    #[serde(default)]
    pub body_hash: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLanguage {
    Rust,
    Python,
    TypeScript,
    Go,
    Unknown,
}

pub fn detect_language(path: &std::path::Path) -> SourceLanguage {
    match path.extension().and_then(|e| e.to_str()) {
        Some("rs") => SourceLanguage::Rust,
        Some("py") => SourceLanguage::Python,
        Some("ts") | Some("tsx") => SourceLanguage::TypeScript,
        Some("go") => SourceLanguage::Go,
        _ => SourceLanguage::Unknown,
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisResult {
    pub changes: Vec<SemanticChange>,
    pub has_modifications: bool,
}

struct TopLevelEntity {
    name: String,
    body: String,
    line_start: u32,
    line_end: u32,
    is_class: bool,
}

/// Compares `baseline` against `modified` and produces typed changes.
/// Unparseable languages short-circuit per §4.7: an empty change list but
/// `has_modifications=true` whenever the raw text differs, signalling the
/// merger to fall back to direct copy.
pub fn analyze(baseline: &str, modified: &str, language: SourceLanguage) -> AnalysisResult {
    if baseline == modified {
        return AnalysisResult::default();
    }

    match language {
        SourceLanguage::Rust => analyze_with_grammar(
            baseline,
            modified,
            tree_sitter_rust::LANGUAGE.into(),
            &["function_item"],
            &["use_declaration"],
            &["struct_item", "impl_item", "trait_item"],
        ),
        SourceLanguage::Python => analyze_with_grammar(
            baseline,
            modified,
            tree_sitter_python::LANGUAGE.into(),
            &["function_definition"],
            &["import_statement", "import_from_statement"],
            &["class_definition"],
        ),
        SourceLanguage::TypeScript | SourceLanguage::Go | SourceLanguage::Unknown => {
            AnalysisResult {
                changes: Vec::new(),
                has_modifications: true,
            }
        }
    }
}

fn analyze_with_grammar(
    baseline: &str,
    modified: &str,
    grammar: tree_sitter::Language,
    function_kinds: &[&str],
    import_kinds: &[&str],
    class_kinds: &[&str],
) -> AnalysisResult {
    let mut parser = tree_sitter::Parser::new();
    if parser.set_language(&grammar).is_err() {
        return AnalysisResult {
            changes: Vec::new(),
            has_modifications: true,
        };
    }

    let (Some(baseline_tree), Some(modified_tree)) =
        (parser.parse(baseline, None), parser.parse(modified, None))
    else {
        return AnalysisResult {
            changes: Vec::new(),
            has_modifications: true,
        };
    };

    let baseline_funcs = top_level_entities(&baseline_tree, baseline, function_kinds, false);
    let modified_funcs = top_level_entities(&modified_tree, modified, function_kinds, false);
    let baseline_classes = top_level_entities(&baseline_tree, baseline, class_kinds, true);
    let modified_classes = top_level_entities(&modified_tree, modified, class_kinds, true);
    let baseline_imports = top_level_import_names(&baseline_tree, baseline, import_kinds);
    let modified_imports = top_level_import_names(&modified_tree, modified, import_kinds);

    let mut changes = Vec::new();
    changes.extend(diff_entities(
        &baseline_funcs,
        &modified_funcs,
        SemanticChangeKind::AddFunction,
        SemanticChangeKind::ModifyFunction,
        SemanticChangeKind::RemoveFunction,
    ));
    changes.extend(diff_entities(
        &baseline_classes,
        &modified_classes,
        SemanticChangeKind::AddClass,
        SemanticChangeKind::ModifyClass,
        SemanticChangeKind::ModifyClass,
    ));
    changes.extend(diff_imports(&baseline_imports, &modified_imports));

    AnalysisResult {
        has_modifications: !changes.is_empty(),
        changes,
    }
}

fn top_level_entities(
    tree: &tree_sitter::Tree,
    source: &str,
    kinds: &[&str],
    is_class: bool,
) -> BTreeMap<String, TopLevelEntity> {
    let mut out = BTreeMap::new();
    let root = tree.root_node();
    let mut cursor = root.walk();
    for node in root.children(&mut cursor) {
        if !kinds.contains(&node.kind()) {
            continue;
        }
        if let Some(name) = identifier_name(&node, source) {
            let body = node.utf8_text(source.as_bytes()).unwrap_or("").to_string();
            out.insert(
                name.clone(),
                TopLevelEntity {
                    name,
                    body,
                    line_start: node.start_position().row as u32 + 1,
                    line_end: node.end_position().row as u32 + 1,
                    is_class,
                },
            );
        }
    }
    out
}

fn identifier_name(node: &tree_sitter::Node, source: &str) -> Option<String> {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.kind() == "identifier" || child.kind() == "type_identifier" {
            return child.utf8_text(source.as_bytes()).ok().map(|s| s.to_string());
        }
    }
    None
}

fn top_level_import_names(tree: &tree_sitter::Tree, source: &str, kinds: &[&str]) -> BTreeMap<String, (u32, u32)> {
    let mut out = BTreeMap::new();
    let root = tree.root_node();
    let mut cursor = root.walk();
    for node in root.children(&mut cursor) {
        if !kinds.contains(&node.kind()) {
            continue;
        }
        let text = node.utf8_text(source.as_bytes()).unwrap_or("").trim().to_string();
        out.insert(
            text,
            (node.start_position().row as u32 + 1, node.end_position().row as u32 + 1),
        );
    }
    out
}

fn diff_entities(
    baseline: &BTreeMap<String, TopLevelEntity>,
    modified: &BTreeMap<String, TopLevelEntity>,
    add_kind: SemanticChangeKind,
    modify_kind: SemanticChangeKind,
    remove_kind: SemanticChangeKind,
) -> Vec<SemanticChange> {
    let mut changes = Vec::new();
    for (name, entity) in modified {
        match baseline.get(name) {
            None => changes.push(SemanticChange {
                kind: add_kind,
                target: name.clone(),
                line_start: entity.line_start,
                line_end: entity.line_end,
                body_hash: Some(hash_body(&entity.body)),
            }),
            Some(base_entity) if base_entity.body != entity.body => changes.push(SemanticChange {
                kind: modify_kind,
                target: name.clone(),
                line_start: entity.line_start,
                line_end: entity.line_end,
                body_hash: Some(hash_body(&entity.body)),
            }),
            Some(_) => {}
        }
    }
    for (name, entity) in baseline {
        if !modified.contains_key(name) {
            changes.push(SemanticChange {
                kind: remove_kind,
                target: name.clone(),
                line_start: entity.line_start,
                line_end: entity.line_end,
                body_hash: None,
            });
        }
    }
    changes
}

fn diff_imports(baseline: &BTreeMap<String, (u32, u32)>, modified: &BTreeMap<String, (u32, u32)>) -> Vec<SemanticChange> {
    let mut changes = Vec::new();
    for (text, (start, end)) in modified {
        if !baseline.contains_key(text) {
            changes.push(SemanticChange {
                kind: SemanticChangeKind::AddImport,
                target: text.clone(),
                line_start: *start,
                line_end: *end,
                body_hash: None,
            });
        }
    }
    for (text, (start, end)) in baseline {
        if !modified.contains_key(text) {
            changes.push(SemanticChange {
                kind: SemanticChangeKind::RemoveImport,
                target: text.clone(),
                line_start: *start,
                line_end: *end,
                body_hash: None,
            });
        }
    }
    changes
}
