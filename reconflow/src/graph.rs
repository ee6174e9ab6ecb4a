//! Declarative stage graph
//!
//! A pipeline is a list of [`StageSpec`]s wired by name: each input names a
//! producer stage and one of its declared outputs. [`PipelineGraph::build`]
//! validates the wiring once per run (fail fast, before any subject is
//! touched) and freezes the graph; [`PipelineGraph::instantiate`] then binds
//! one subject's values into it without mutating the shared graph.
//!
//! # Lifecycle
//! constructed → validated (frozen) → instantiated per subject → submitted
//!
//! Source stages (no command) hold values computed in-process, such as
//! located files and resolved parameters; they never become jobs. Command
//! stages render to a command line plus the job-level predecessors the
//! backend must wait for.

use crate::locator::FileSet;
use reconflow_common::SubjectIdentity;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use thiserror::Error;

/// Structural problems found while building a graph
#[derive(Debug, Error, PartialEq)]
pub enum GraphValidationError {
    #[error("Pipeline has no stages")]
    Empty,

    #[error("Duplicate stage name: {0}")]
    DuplicateStage(String),

    #[error("Stage {stage} declares input {input} more than once")]
    DuplicateInput { stage: String, input: String },

    #[error("Stage {stage} input {input} references unknown stage {producer}")]
    UnknownProducer {
        stage: String,
        input: String,
        producer: String,
    },

    #[error("Stage {stage} input {input} references undeclared output {producer}.{output}")]
    UnknownOutput {
        stage: String,
        input: String,
        producer: String,
        output: String,
    },

    #[error("Stage {stage} refers to undeclared input {input}")]
    UnknownInput { stage: String, input: String },

    #[error("Stage {stage} requires {capability}, which is not available for this run")]
    MissingCapability { stage: String, capability: String },

    #[error("Dependency cycle among stages: {}", .stages.join(", "))]
    Cycle { stages: Vec<String> },
}

/// Problems binding one subject's values into a graph
#[derive(Debug, Error, PartialEq)]
pub enum InstantiationError {
    #[error("No value bound for {stage}.{output}")]
    Unbound { stage: String, output: String },

    #[error("Stage {stage} input {input} must be {expected}")]
    InvalidValue {
        stage: String,
        input: String,
        expected: &'static str,
    },
}

/// Value carried along an edge
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Path(PathBuf),
    Files(FileSet),
    /// Pre-split command-line arguments
    Args(Vec<String>),
}

impl Value {
    /// Command-line rendering, one element per argument
    fn to_args(&self) -> Vec<String> {
        match self {
            Value::Text(s) => vec![s.clone()],
            Value::Path(p) => vec![p.to_string_lossy().into_owned()],
            Value::Files(files) => files
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            Value::Args(args) => args.clone(),
        }
    }

    /// Single string rendering for text-like values
    fn as_single(&self) -> Option<String> {
        match self {
            Value::Text(s) => Some(s.clone()),
            Value::Path(p) => Some(p.to_string_lossy().into_owned()),
            Value::Files(files) if files.len() == 1 => {
                Some(files.paths()[0].to_string_lossy().into_owned())
            }
            _ => None,
        }
    }
}

/// Set of run-wide capability flags (e.g. scan tags common to every site)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities(BTreeSet<String>);

impl Capabilities {
    pub fn from_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(tags.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, capability: &str) -> bool {
        self.0.contains(capability)
    }
}

/// Reference to a producer's output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRef {
    pub producer: String,
    pub output: String,
}

/// Declared input of a stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSpec {
    pub name: String,
    pub source: InputRef,
    /// Edge exists only when this capability is enabled for the run
    pub capability: Option<String>,
}

/// One element of a command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Literal(String),
    /// Every element of the input's value, bare
    Input(String),
    /// `flag` before every element of the input's value
    Flagged { flag: String, input: String },
    /// Literal emitted only when the input is wired and non-empty
    IfPresent { input: String, arg: String },
}

/// How a declared output gets its value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSpec {
    /// Injected per subject through [`Bindings`]
    Bound,
    /// Same value as one of the stage's inputs
    FromInput(String),
    /// Named file the command produces: `path` under the directory given by
    /// `dir_input`; `{input}` placeholders expand to text-valued inputs
    File { dir_input: String, path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<Arg>,
}

/// Per-stage hints forwarded to the scheduler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceHints {
    /// Cores on one node
    pub cores: Option<u32>,
}

/// Stage declaration, before validation
#[derive(Debug, Clone, PartialEq)]
pub struct StageSpec {
    pub name: String,
    pub command: Option<CommandSpec>,
    pub inputs: Vec<InputSpec>,
    pub outputs: BTreeMap<String, OutputSpec>,
    /// Capabilities without which the stage (and the pipeline) cannot run
    pub requires: Vec<String>,
    pub resource_hints: ResourceHints,
}

impl StageSpec {
    /// Stage whose outputs are bound in-process for each subject
    pub fn source(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: None,
            inputs: Vec::new(),
            outputs: BTreeMap::new(),
            requires: Vec::new(),
            resource_hints: ResourceHints::default(),
        }
    }

    /// Stage run as an external command
    pub fn command(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            command: Some(CommandSpec {
                program: program.into(),
                args: Vec::new(),
            }),
            ..Self::source(name)
        }
    }

    pub fn input(mut self, name: &str, producer: &str, output: &str) -> Self {
        self.inputs.push(InputSpec {
            name: name.to_string(),
            source: InputRef {
                producer: producer.to_string(),
                output: output.to_string(),
            },
            capability: None,
        });
        self
    }

    /// Input wired only when `capability` is enabled
    pub fn optional_input(mut self, name: &str, producer: &str, output: &str, capability: &str) -> Self {
        self = self.input(name, producer, output);
        if let Some(input) = self.inputs.last_mut() {
            input.capability = Some(capability.to_string());
        }
        self
    }

    /// Append a command-line element (ignored on source stages)
    pub fn arg(mut self, arg: Arg) -> Self {
        if let Some(command) = self.command.as_mut() {
            command.args.push(arg);
        }
        self
    }

    pub fn bound_output(mut self, name: &str) -> Self {
        self.outputs.insert(name.to_string(), OutputSpec::Bound);
        self
    }

    pub fn passthrough_output(mut self, name: &str, input: &str) -> Self {
        self.outputs
            .insert(name.to_string(), OutputSpec::FromInput(input.to_string()));
        self
    }

    pub fn file_output(mut self, name: &str, dir_input: &str, path: &str) -> Self {
        self.outputs.insert(
            name.to_string(),
            OutputSpec::File {
                dir_input: dir_input.to_string(),
                path: path.to_string(),
            },
        );
        self
    }

    pub fn requires(mut self, capability: &str) -> Self {
        self.requires.push(capability.to_string());
        self
    }

    pub fn hints(mut self, hints: ResourceHints) -> Self {
        self.resource_hints = hints;
        self
    }
}

/// Validated, immutable stage
#[derive(Debug, Clone, PartialEq)]
pub struct StageNode {
    pub name: String,
    pub command: Option<CommandSpec>,
    /// Wired inputs only; optional inputs of disabled capabilities are absent
    pub inputs: BTreeMap<String, InputRef>,
    pub outputs: BTreeMap<String, OutputSpec>,
    pub resource_hints: ResourceHints,
}

/// Frozen DAG of stages, in a deterministic topological order
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    nodes: Vec<StageNode>,
}

impl PipelineGraph {
    /// Validate `specs` against the run's capabilities and freeze the graph
    ///
    /// Nothing is constructed when any check fails.
    pub fn build(
        specs: Vec<StageSpec>,
        capabilities: &Capabilities,
    ) -> Result<Self, GraphValidationError> {
        if specs.is_empty() {
            return Err(GraphValidationError::Empty);
        }

        let mut by_name: BTreeMap<String, StageSpec> = BTreeMap::new();
        for spec in specs {
            if by_name.contains_key(&spec.name) {
                return Err(GraphValidationError::DuplicateStage(spec.name));
            }
            by_name.insert(spec.name.clone(), spec);
        }

        let mut nodes: BTreeMap<String, StageNode> = BTreeMap::new();
        for spec in by_name.values() {
            let node = validate_stage(spec, &by_name, capabilities)?;
            nodes.insert(node.name.clone(), node);
        }

        let order = topological_order(&nodes)?;
        let nodes = order
            .into_iter()
            .filter_map(|name| nodes.remove(&name))
            .collect();
        Ok(Self { nodes })
    }

    /// Stages in execution order
    pub fn stages(&self) -> &[StageNode] {
        &self.nodes
    }

    pub fn stage(&self, name: &str) -> Option<&StageNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Bind one subject's values and render every command stage
    pub fn instantiate(
        &self,
        identity: &SubjectIdentity,
        bindings: &Bindings,
    ) -> Result<RealizedGraph, InstantiationError> {
        let mut values: BTreeMap<(String, String), Value> = BTreeMap::new();
        // Command stages each stage transitively waits on
        let mut waits: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
        let mut stages = Vec::new();

        for node in &self.nodes {
            let mut inputs: BTreeMap<&str, &Value> = BTreeMap::new();
            let mut predecessors = BTreeSet::new();
            for (name, source) in &node.inputs {
                let key = (source.producer.clone(), source.output.clone());
                let value = values.get(&key).ok_or_else(|| InstantiationError::Unbound {
                    stage: source.producer.clone(),
                    output: source.output.clone(),
                })?;
                inputs.insert(name.as_str(), value);

                let producer_is_job = self
                    .stage(&source.producer)
                    .is_some_and(|p| p.command.is_some());
                if producer_is_job {
                    predecessors.insert(source.producer.clone());
                } else if let Some(upstream) = waits.get(source.producer.as_str()) {
                    predecessors.extend(upstream.iter().cloned());
                }
            }

            let mut outputs = BTreeMap::new();
            for (output, spec) in &node.outputs {
                let value = resolve_output(node, output, spec, &inputs, bindings)?;
                outputs.insert(output.clone(), value);
            }

            if let Some(command) = &node.command {
                let mut argv = vec![command.program.clone()];
                for arg in &command.args {
                    argv.extend(render_arg(arg, &inputs));
                }
                let output_files = node
                    .outputs
                    .iter()
                    .filter(|(_, spec)| matches!(spec, OutputSpec::File { .. }))
                    .filter_map(|(name, _)| match outputs.get(name) {
                        Some(Value::Path(path)) => Some((name.clone(), path.clone())),
                        _ => None,
                    })
                    .collect();
                stages.push(RealizedStage {
                    name: node.name.clone(),
                    command: argv,
                    predecessors: predecessors.iter().cloned().collect(),
                    resource_hints: node.resource_hints.clone(),
                    outputs: outputs.clone(),
                    output_files,
                });
            }

            for (output, value) in outputs {
                values.insert((node.name.clone(), output), value);
            }
            waits.insert(node.name.as_str(), predecessors);
        }

        Ok(RealizedGraph {
            subject: identity.clone(),
            stages,
        })
    }
}

fn validate_stage(
    spec: &StageSpec,
    all: &BTreeMap<String, StageSpec>,
    capabilities: &Capabilities,
) -> Result<StageNode, GraphValidationError> {
    for capability in &spec.requires {
        if !capabilities.contains(capability) {
            return Err(GraphValidationError::MissingCapability {
                stage: spec.name.clone(),
                capability: capability.clone(),
            });
        }
    }

    let declared: BTreeSet<&str> = spec.inputs.iter().map(|i| i.name.as_str()).collect();
    if declared.len() != spec.inputs.len() {
        let mut seen = BTreeSet::new();
        let duplicate = spec
            .inputs
            .iter()
            .find(|i| !seen.insert(i.name.as_str()))
            .map(|i| i.name.clone())
            .unwrap_or_default();
        return Err(GraphValidationError::DuplicateInput {
            stage: spec.name.clone(),
            input: duplicate,
        });
    }

    let mut inputs = BTreeMap::new();
    for input in &spec.inputs {
        let enabled = input
            .capability
            .as_deref()
            .map_or(true, |c| capabilities.contains(c));
        if !enabled {
            continue;
        }

        let producer = all.get(&input.source.producer).ok_or_else(|| {
            GraphValidationError::UnknownProducer {
                stage: spec.name.clone(),
                input: input.name.clone(),
                producer: input.source.producer.clone(),
            }
        })?;
        if !producer.outputs.contains_key(&input.source.output) {
            return Err(GraphValidationError::UnknownOutput {
                stage: spec.name.clone(),
                input: input.name.clone(),
                producer: input.source.producer.clone(),
                output: input.source.output.clone(),
            });
        }
        inputs.insert(input.name.clone(), input.source.clone());
    }

    let unknown_input = |input: &str| GraphValidationError::UnknownInput {
        stage: spec.name.clone(),
        input: input.to_string(),
    };

    // Outputs may only derive from inputs wired for this run
    for output in spec.outputs.values() {
        match output {
            OutputSpec::Bound => {}
            OutputSpec::FromInput(input) | OutputSpec::File { dir_input: input, .. } => {
                if !inputs.contains_key(input) {
                    return Err(unknown_input(input));
                }
            }
        }
    }

    // Arguments may name optional inputs; those render to nothing when unwired
    if let Some(command) = &spec.command {
        for arg in &command.args {
            let referenced = match arg {
                Arg::Literal(_) => None,
                Arg::Input(input) | Arg::Flagged { input, .. } | Arg::IfPresent { input, .. } => {
                    Some(input)
                }
            };
            if let Some(input) = referenced {
                if !declared.contains(input.as_str()) {
                    return Err(unknown_input(input));
                }
            }
        }
    }

    Ok(StageNode {
        name: spec.name.clone(),
        command: spec.command.clone(),
        inputs,
        outputs: spec.outputs.clone(),
        resource_hints: spec.resource_hints.clone(),
    })
}

/// Kahn's algorithm; ties broken by stage name so the order is deterministic
fn topological_order(
    nodes: &BTreeMap<String, StageNode>,
) -> Result<Vec<String>, GraphValidationError> {
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for node in nodes.values() {
        let producers: BTreeSet<&str> = node
            .inputs
            .values()
            .map(|i| i.producer.as_str())
            .collect();
        in_degree.insert(node.name.as_str(), producers.len());
        for producer in producers {
            dependents
                .entry(producer)
                .or_default()
                .insert(node.name.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(name) = ready.pop_first() {
        order.push(name.to_string());
        for dependent in dependents.get(name).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }

    if order.len() < nodes.len() {
        let stages = in_degree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(name, _)| name.to_string())
            .collect();
        return Err(GraphValidationError::Cycle { stages });
    }
    Ok(order)
}

fn resolve_output(
    node: &StageNode,
    output: &str,
    spec: &OutputSpec,
    inputs: &BTreeMap<&str, &Value>,
    bindings: &Bindings,
) -> Result<Value, InstantiationError> {
    let input_value = |input: &str| {
        inputs
            .get(input)
            .copied()
            .ok_or_else(|| InstantiationError::Unbound {
                stage: node.name.clone(),
                output: output.to_string(),
            })
    };

    match spec {
        OutputSpec::Bound => bindings
            .get(&node.name, output)
            .cloned()
            .ok_or_else(|| InstantiationError::Unbound {
                stage: node.name.clone(),
                output: output.to_string(),
            }),
        OutputSpec::FromInput(input) => input_value(input).cloned(),
        OutputSpec::File { dir_input, path } => {
            let dir = input_value(dir_input)?
                .as_single()
                .ok_or_else(|| InstantiationError::InvalidValue {
                    stage: node.name.clone(),
                    input: dir_input.clone(),
                    expected: "a single directory path",
                })?;
            let mut relative = path.clone();
            for (name, value) in inputs {
                let placeholder = format!("{{{}}}", name);
                if relative.contains(&placeholder) {
                    let text = value.as_single().ok_or_else(|| InstantiationError::InvalidValue {
                        stage: node.name.clone(),
                        input: name.to_string(),
                        expected: "a single text value",
                    })?;
                    relative = relative.replace(&placeholder, &text);
                }
            }
            Ok(Value::Path(PathBuf::from(dir).join(relative)))
        }
    }
}

fn render_arg(arg: &Arg, inputs: &BTreeMap<&str, &Value>) -> Vec<String> {
    match arg {
        Arg::Literal(s) => vec![s.clone()],
        Arg::Input(input) => inputs
            .get(input.as_str())
            .map(|v| v.to_args())
            .unwrap_or_default(),
        Arg::Flagged { flag, input } => inputs
            .get(input.as_str())
            .map(|v| {
                v.to_args()
                    .into_iter()
                    .flat_map(|a| [flag.clone(), a])
                    .collect()
            })
            .unwrap_or_default(),
        Arg::IfPresent { input, arg } => {
            let present = inputs
                .get(input.as_str())
                .is_some_and(|v| !v.to_args().is_empty());
            if present {
                vec![arg.clone()]
            } else {
                Vec::new()
            }
        }
    }
}

/// Per-subject values for `Bound` outputs
#[derive(Debug, Clone, Default)]
pub struct Bindings(BTreeMap<(String, String), Value>);

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, stage: &str, output: &str, value: Value) -> &mut Self {
        self.0.insert((stage.to_string(), output.to_string()), value);
        self
    }

    pub fn get(&self, stage: &str, output: &str) -> Option<&Value> {
        self.0.get(&(stage.to_string(), output.to_string()))
    }
}

/// One command stage rendered for one subject
#[derive(Debug, Clone, PartialEq)]
pub struct RealizedStage {
    pub name: String,
    /// Program followed by its arguments
    pub command: Vec<String>,
    /// Command stages that must succeed before this one starts
    pub predecessors: Vec<String>,
    pub resource_hints: ResourceHints,
    pub outputs: BTreeMap<String, Value>,
    /// Files the command is expected to produce, by output name
    pub output_files: BTreeMap<String, PathBuf>,
}

impl RealizedStage {
    pub fn expected_files(&self) -> Vec<&PathBuf> {
        self.output_files.values().collect()
    }

    /// Whether the command already ran: it names output files and all exist
    pub fn is_complete(&self) -> bool {
        let files = self.expected_files();
        !files.is_empty() && files.iter().all(|p| p.exists())
    }
}

/// Per-subject instantiation of a [`PipelineGraph`], consumed by a backend
#[derive(Debug, Clone, PartialEq)]
pub struct RealizedGraph {
    pub subject: SubjectIdentity,
    /// Command stages in dependency order
    pub stages: Vec<RealizedStage>,
}

impl RealizedGraph {
    pub fn stage(&self, name: &str) -> Option<&RealizedStage> {
        self.stages.iter().find(|s| s.name == name)
    }
}
