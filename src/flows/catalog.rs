//! Loaded, validated flows.
//!
//! Flows are validated when they enter the catalog: unique step names, a
//! single entry point, resolvable transition targets, reachability, no
//! transition-less automatic steps, compilable regexes, and existing target
//! flows for `switch_flow` steps and switch fallbacks.

use crate::flows::condition::ConditionConfig;
use crate::flows::definition::{
    parse_flows, DefinitionError, FallbackAction, FlowDefinition, StepDefinition, StepKind,
};
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A validated flow with its step index.
#[derive(Debug)]
pub struct Flow {
    definition: FlowDefinition,
    index: HashMap<String, usize>,
    entry: usize,
    keywords: Vec<(String, Regex)>,
}

impl Flow {
    /// Validate a single definition on its own (no cross-flow checks).
    pub fn compile(definition: FlowDefinition) -> Result<Self, Vec<DefinitionError>> {
        let flow = definition.name.clone();
        let mut errors = Vec::new();

        let mut index = HashMap::new();
        for (i, step) in definition.steps.iter().enumerate() {
            if index.insert(step.name.clone(), i).is_some() {
                errors.push(DefinitionError::DuplicateStep {
                    flow: flow.clone(),
                    step: step.name.clone(),
                });
            }
        }

        let entries: Vec<usize> = definition
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_entry_point)
            .map(|(i, _)| i)
            .collect();
        if entries.len() != 1 {
            errors.push(DefinitionError::EntryPoint {
                flow: flow.clone(),
                count: entries.len(),
            });
        }

        for step in &definition.steps {
            check_step(&flow, step, &index, &mut errors);
        }

        if let [entry] = entries.as_slice() {
            for unreachable in unreachable_steps(&definition, &index, *entry) {
                errors.push(DefinitionError::Unreachable {
                    flow: flow.clone(),
                    step: unreachable,
                });
            }
        }

        let keywords = definition
            .trigger_keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .filter_map(|k| keyword_regex(k).map(|re| (k.to_string(), re)))
            .collect();

        match (errors.is_empty(), entries.first()) {
            (true, Some(&entry)) => Ok(Self {
                definition,
                index,
                entry,
                keywords,
            }),
            _ => Err(errors),
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn version(&self) -> u32 {
        self.definition.version
    }

    pub fn is_active(&self) -> bool {
        self.definition.is_active
    }

    pub fn definition(&self) -> &FlowDefinition {
        &self.definition
    }

    pub fn entry_step(&self) -> &StepDefinition {
        &self.definition.steps[self.entry]
    }

    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.index.get(name).map(|&i| &self.definition.steps[i])
    }

    /// The trigger keyword contained in `text` as a whole word, if any.
    pub fn match_trigger(&self, text: &str) -> Option<&str> {
        let text = text.trim();
        self.keywords
            .iter()
            .find(|(keyword, re)| keyword.eq_ignore_ascii_case(text) || re.is_match(text))
            .map(|(keyword, _)| keyword.as_str())
    }
}

fn check_step(
    flow: &str,
    step: &StepDefinition,
    index: &HashMap<String, usize>,
    errors: &mut Vec<DefinitionError>,
) {
    for transition in &step.transitions {
        if !index.contains_key(&transition.to_step) {
            errors.push(DefinitionError::UnknownStep {
                flow: flow.to_string(),
                step: step.name.clone(),
                target: transition.to_step.clone(),
            });
        }
        match &transition.condition_config {
            ConditionConfig::UserReplyMatchesRegex { regex } => {
                check_regex(flow, &step.name, regex, errors)
            }
            ConditionConfig::Unknown => warn!(
                flow = %flow,
                step = %step.name,
                to_step = %transition.to_step,
                "transition has an unknown condition type and will never match"
            ),
            _ => {}
        }
    }

    if !step.is_terminal() && step.transitions.is_empty() {
        errors.push(DefinitionError::DeadEnd {
            flow: flow.to_string(),
            step: step.name.clone(),
        });
    }

    if let StepKind::Question(question) = &step.kind {
        if let Some(regex) = &question.reply_config.validation_regex {
            check_regex(flow, &step.name, regex, errors);
        }
        if let Some(fallback) = &question.fallback_config {
            if fallback.action == FallbackAction::SwitchFlow
                && fallback.target_flow_name.as_deref().is_none_or(|t| t.trim().is_empty())
            {
                errors.push(DefinitionError::MissingFlowTarget {
                    flow: flow.to_string(),
                    step: step.name.clone(),
                });
            }
        }
    }
}

fn check_regex(flow: &str, step: &str, regex: &str, errors: &mut Vec<DefinitionError>) {
    if let Err(e) = Regex::new(regex) {
        errors.push(DefinitionError::InvalidRegex {
            flow: flow.to_string(),
            step: step.to_string(),
            regex: regex.to_string(),
            reason: e.to_string(),
        });
    }
}

fn unreachable_steps(
    definition: &FlowDefinition,
    index: &HashMap<String, usize>,
    entry: usize,
) -> Vec<String> {
    let mut seen = HashSet::from([entry]);
    let mut queue = VecDeque::from([entry]);
    while let Some(i) = queue.pop_front() {
        for transition in &definition.steps[i].transitions {
            if let Some(&next) = index.get(&transition.to_step) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
    }
    definition
        .steps
        .iter()
        .enumerate()
        .filter(|(i, _)| !seen.contains(i))
        .map(|(_, s)| s.name.clone())
        .collect()
}

/// Whole-word matcher for a trigger keyword. `\b` only holds next to word
/// characters, so edges like `#help` or `c++` are bounded by whitespace or
/// the ends of the message instead.
fn keyword_regex(keyword: &str) -> Option<Regex> {
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    let leading = match keyword.chars().next() {
        Some(c) if is_word(c) => r"\b",
        _ => r"(?:^|\s)",
    };
    let trailing = match keyword.chars().last() {
        Some(c) if is_word(c) => r"\b",
        _ => r"(?:$|\s)",
    };
    Regex::new(&format!("(?i){leading}{}{trailing}", regex::escape(keyword))).ok()
}

/// Flow names targeted by a step: `switch_flow` and switch fallbacks.
fn flow_references(step: &StepDefinition) -> Vec<&str> {
    match &step.kind {
        StepKind::SwitchFlow(config) => vec![config.target_flow_name.as_str()],
        StepKind::Question(question) => match &question.fallback_config {
            Some(fallback) if fallback.action == FallbackAction::SwitchFlow => {
                fallback.target_flow_name.as_deref().into_iter().collect()
            }
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// All loaded flows, keyed by (name, version).
#[derive(Debug, Default)]
pub struct FlowCatalog {
    /// Versions per flow name, ascending.
    flows: BTreeMap<String, BTreeMap<u32, Arc<Flow>>>,
}

impl FlowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and index a set of definitions.
    ///
    /// Every problem found is reported; the catalog is only built when there
    /// are none.
    pub fn from_definitions(
        definitions: Vec<FlowDefinition>,
    ) -> Result<Self, Vec<DefinitionError>> {
        let mut catalog = Self::new();
        let mut errors = Vec::new();

        for definition in definitions {
            let (name, version) = (definition.name.clone(), definition.version);
            if catalog.get_version(&name, version).is_some() {
                errors.push(DefinitionError::DuplicateFlow {
                    flow: name,
                    version,
                });
                continue;
            }
            match Flow::compile(definition) {
                Ok(flow) => {
                    catalog
                        .flows
                        .entry(name)
                        .or_default()
                        .insert(version, Arc::new(flow));
                }
                Err(mut flow_errors) => errors.append(&mut flow_errors),
            }
        }

        for flow in catalog.all() {
            for step in &flow.definition.steps {
                for target in flow_references(step) {
                    if catalog.get(target).is_none() {
                        errors.push(DefinitionError::UnknownFlow {
                            flow: flow.name().to_string(),
                            step: step.name.clone(),
                            target: target.to_string(),
                        });
                    }
                }
            }
        }

        if errors.is_empty() {
            info!(flows = catalog.len(), "flow catalog loaded");
            Ok(catalog)
        } else {
            Err(errors)
        }
    }

    /// Load a single JSON5 flow file.
    pub fn load_file(path: &Path) -> Result<Self, Vec<DefinitionError>> {
        Self::from_definitions(read_definitions(path).map_err(|e| vec![e])?)
    }

    /// Load every `.json5` / `.json` file in a directory (non-recursive,
    /// sorted by file name).
    pub fn load_dir(dir: &Path) -> Result<Self, Vec<DefinitionError>> {
        let io_err = |source: std::io::Error| {
            vec![DefinitionError::Io {
                path: dir.to_path_buf(),
                source,
            }]
        };
        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .map_err(io_err)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| e == "json5" || e == "json")
            })
            .collect();
        paths.sort();

        let mut definitions = Vec::new();
        let mut errors = Vec::new();
        for path in &paths {
            match read_definitions(path) {
                Ok(mut defs) => {
                    debug!(path = %path.display(), flows = defs.len(), "read flow file");
                    definitions.append(&mut defs);
                }
                Err(e) => errors.push(e),
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }
        Self::from_definitions(definitions)
    }

    /// Load a file or a directory.
    pub fn load_path(path: &Path) -> Result<Self, Vec<DefinitionError>> {
        if path.is_dir() {
            Self::load_dir(path)
        } else {
            Self::load_file(path)
        }
    }

    /// Highest active version of a flow.
    pub fn get(&self, name: &str) -> Option<Arc<Flow>> {
        self.flows
            .get(name)?
            .values()
            .rev()
            .find(|f| f.is_active())
            .cloned()
    }

    /// Exact version, active or not. Runs in progress keep their version.
    pub fn get_version(&self, name: &str, version: u32) -> Option<Arc<Flow>> {
        self.flows.get(name)?.get(&version).cloned()
    }

    /// First active flow (by name) whose trigger keyword appears in `text`.
    pub fn find_by_trigger(&self, text: &str) -> Option<(Arc<Flow>, String)> {
        self.flows.keys().find_map(|name| {
            let flow = self.get(name)?;
            let keyword = flow.match_trigger(text)?.to_string();
            Some((flow, keyword))
        })
    }

    /// Every loaded flow version.
    pub fn all(&self) -> impl Iterator<Item = &Arc<Flow>> {
        self.flows.values().flat_map(|versions| versions.values())
    }

    /// Number of loaded flow versions.
    pub fn len(&self) -> usize {
        self.flows.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

fn read_definitions(path: &Path) -> Result<Vec<FlowDefinition>, DefinitionError> {
    let source = std::fs::read_to_string(path).map_err(|source| DefinitionError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_flows(&source, &path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn definition(value: Value) -> FlowDefinition {
        serde_json::from_value(value).unwrap()
    }

    fn simple(name: &str, version: u32, active: bool, keywords: &[&str]) -> FlowDefinition {
        definition(json!({
            "name": name,
            "version": version,
            "is_active": active,
            "trigger_keywords": keywords,
            "steps": [
                {"name": "start", "is_entry_point": true, "type": "send_message",
                 "config": {"message_type": "text", "text": {"body": "hi"}},
                 "transitions": [{"to_step": "done"}]},
                {"name": "done", "type": "end_flow"}
            ]
        }))
    }

    #[test]
    fn test_valid_flow_compiles() {
        let flow = Flow::compile(simple("greet", 1, true, &["hello"])).unwrap();
        assert_eq!(flow.entry_step().name, "start");
        assert!(flow.step("done").is_some());
        assert!(flow.step("nope").is_none());
    }

    #[test]
    fn test_graph_errors_are_all_reported() {
        let errors = Flow::compile(definition(json!({
            "name": "broken",
            "steps": [
                {"name": "a", "is_entry_point": true, "type": "action",
                 "transitions": [{"to_step": "ghost"}]},
                {"name": "b", "type": "send_message",
                 "config": {"message_type": "text", "text": {"body": "x"}}},
                {"name": "b", "type": "end_flow"}
            ]
        })))
        .unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, DefinitionError::UnknownStep { target, .. } if target == "ghost")));
        assert!(errors.iter().any(|e| matches!(e, DefinitionError::DuplicateStep { step, .. } if step == "b")));
        assert!(errors.iter().any(|e| matches!(e, DefinitionError::DeadEnd { step, .. } if step == "b")));
        assert!(errors.iter().any(|e| matches!(e, DefinitionError::Unreachable { .. })));
    }

    #[test]
    fn test_entry_point_count() {
        let errors = Flow::compile(definition(json!({
            "name": "no_entry",
            "steps": [{"name": "done", "type": "end_flow"}]
        })))
        .unwrap_err();
        assert!(matches!(errors[0], DefinitionError::EntryPoint { count: 0, .. }));
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let errors = Flow::compile(definition(json!({
            "name": "re",
            "steps": [
                {"name": "ask", "is_entry_point": true, "type": "question",
                 "config": {
                    "message_config": {"message_type": "text", "text": {"body": "?"}},
                    "reply_config": {"save_to_variable": "v", "validation_regex": "("}
                 },
                 "transitions": [{"to_step": "done"}]},
                {"name": "done", "type": "end_flow"}
            ]
        })))
        .unwrap_err();
        assert!(matches!(errors[0], DefinitionError::InvalidRegex { .. }));
    }

    #[test]
    fn test_switch_target_must_exist() {
        let switching = definition(json!({
            "name": "router",
            "steps": [{"name": "go", "is_entry_point": true, "type": "switch_flow",
                       "config": {"target_flow_name": "missing"}}]
        }));
        let errors = FlowCatalog::from_definitions(vec![switching.clone()]).unwrap_err();
        assert!(matches!(&errors[0], DefinitionError::UnknownFlow { target, .. } if target == "missing"));

        let target = simple("missing", 1, true, &[]);
        assert!(FlowCatalog::from_definitions(vec![switching, target]).is_ok());
    }

    #[test]
    fn test_switch_fallback_requires_target() {
        let errors = FlowCatalog::from_definitions(vec![definition(json!({
            "name": "picky",
            "steps": [
                {"name": "ask", "is_entry_point": true, "type": "question",
                 "config": {
                    "message_config": {"message_type": "text", "text": {"body": "?"}},
                    "reply_config": {"save_to_variable": "v", "expected_type": "interactive_id"},
                    "fallback_config": {"action": "switch_flow", "max_retries": 0}
                 },
                 "transitions": [{"to_step": "done"}]},
                {"name": "done", "type": "end_flow"}
            ]
        }))])
        .unwrap_err();
        assert!(matches!(&errors[0], DefinitionError::MissingFlowTarget { step, .. } if step == "ask"));
    }

    #[test]
    fn test_versions_and_activity() {
        let catalog = FlowCatalog::from_definitions(vec![
            simple("greet", 1, true, &[]),
            simple("greet", 2, true, &[]),
            simple("greet", 3, false, &[]),
        ])
        .unwrap();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.get("greet").unwrap().version(), 2);
        assert!(!catalog.get_version("greet", 3).unwrap().is_active());

        let dup = FlowCatalog::from_definitions(vec![simple("greet", 1, true, &[]), simple("greet", 1, true, &[])]);
        assert!(matches!(dup.unwrap_err()[0], DefinitionError::DuplicateFlow { version: 1, .. }));
    }

    #[test]
    fn test_trigger_matching_whole_word() {
        let catalog =
            FlowCatalog::from_definitions(vec![simple("fiscal", 1, true, &["zimra", "fiscalisation"])])
                .unwrap();
        let (flow, keyword) = catalog.find_by_trigger("Hi, I need ZIMRA help").unwrap();
        assert_eq!(flow.name(), "fiscal");
        assert_eq!(keyword, "zimra");
        assert!(catalog.find_by_trigger("zimrabwe").is_none());
        assert!(catalog.find_by_trigger("hello").is_none());
    }

    #[test]
    fn test_trigger_keywords_with_symbols() {
        let catalog = FlowCatalog::from_definitions(vec![
            simple("help", 1, true, &["#help"]),
            simple("cpp", 1, true, &["c++"]),
        ])
        .unwrap();
        assert_eq!(catalog.find_by_trigger("I need #help").unwrap().0.name(), "help");
        assert_eq!(catalog.find_by_trigger("#help").unwrap().0.name(), "help");
        assert_eq!(catalog.find_by_trigger("learn c++ now").unwrap().0.name(), "cpp");
        assert!(catalog.find_by_trigger("abc++def").is_none());
        assert!(catalog.find_by_trigger("x#helpme").is_none());
    }

    #[test]
    fn test_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.json5"),
            r#"{ name: 'a', steps: [{ name: 'end', is_entry_point: true, type: 'end_flow' }] }"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let catalog = FlowCatalog::load_dir(dir.path()).unwrap();
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get("a").is_some());
    }
}
