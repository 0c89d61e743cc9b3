//! Plan specs and the validated task graph built from them.
//!
//! A [`PlanSpec`] is what callers submit. [`OrchestrationPlan::build`] turns
//! it into an arena of [`TaskNode`]s indexed by position, with dependency
//! and dependent index lists, and rejects it up front when it is empty,
//! has duplicate or unknown task ids, contains a cycle, names an unknown
//! agent or nests deeper than allowed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::Usage;
use crate::orchestration::error::{OrchestrationError, PlanDefect};

/// A declared sub-goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    /// Ignored for subplan tasks.
    #[serde(default)]
    pub agent_id: String,
    /// Overrides the request message for this task.
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub estimated_tokens: u64,
    #[serde(default)]
    pub estimated_cost_usd: f64,
    /// Run a nested plan instead of an agent.
    #[serde(default)]
    pub subplan: Option<Box<PlanSpec>>,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            message: None,
            depends_on: Vec::new(),
            critical: false,
            estimated_tokens: 0,
            estimated_cost_usd: 0.0,
            subplan: None,
        }
    }

    pub fn nested(id: impl Into<String>, plan: PlanSpec) -> Self {
        Self {
            subplan: Some(Box::new(plan)),
            ..Self::new(id, "")
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn with_estimate(mut self, tokens: u64, cost_usd: f64) -> Self {
        self.estimated_tokens = tokens;
        self.estimated_cost_usd = cost_usd;
        self
    }
}

/// A decomposed request as submitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanSpec {
    pub tasks: Vec<TaskSpec>,
    /// Agent that turns the task outputs into the final answer.
    #[serde(default)]
    pub synthesizer: Option<String>,
}

impl PlanSpec {
    pub fn new(tasks: Vec<TaskSpec>) -> Self {
        Self {
            tasks,
            synthesizer: None,
        }
    }

    /// A single-task plan for a simple request.
    pub fn single(agent_id: impl Into<String>) -> Self {
        let agent_id = agent_id.into();
        Self::new(vec![TaskSpec::new(agent_id.clone(), agent_id)])
    }

    pub fn with_synthesizer(mut self, agent_id: impl Into<String>) -> Self {
        self.synthesizer = Some(agent_id.into());
        self
    }

    pub fn from_json(json: &str) -> Result<Self, OrchestrationError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Levels of plans, counting this one. A flat plan has depth 1.
    pub fn nesting_depth(&self) -> u32 {
        1 + self
            .tasks
            .iter()
            .filter_map(|t| t.subplan.as_deref())
            .map(PlanSpec::nesting_depth)
            .max()
            .unwrap_or(0)
    }
}

/// One task in the arena.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub id: String,
    pub agent_id: String,
    pub message: Option<String>,
    pub critical: bool,
    pub estimate: Usage,
    /// Indices of the tasks this one waits for.
    pub depends_on: Vec<usize>,
    /// Indices of the tasks waiting for this one.
    pub dependents: Vec<usize>,
    pub subplan: Option<Arc<OrchestrationPlan>>,
}

/// A validated, acyclic task graph.
#[derive(Debug, Clone)]
pub struct OrchestrationPlan {
    tasks: Vec<TaskNode>,
    order: Vec<usize>,
    synthesizer: Option<String>,
    depth: u32,
}

impl OrchestrationPlan {
    /// Validate `spec` as a plan running at `depth` (0 for a top-level
    /// request) with nested plans allowed down to `max_depth`.
    pub fn build(
        spec: &PlanSpec,
        depth: u32,
        max_depth: u32,
        has_agent: &dyn Fn(&str) -> bool,
    ) -> Result<Self, PlanDefect> {
        if depth > max_depth {
            return Err(PlanDefect::RecursionLimitExceeded {
                depth,
                max: max_depth,
            });
        }
        if spec.tasks.is_empty() {
            return Err(PlanDefect::Empty);
        }

        let mut index: HashMap<&str, usize> = HashMap::with_capacity(spec.tasks.len());
        for (i, task) in spec.tasks.iter().enumerate() {
            if index.insert(task.id.as_str(), i).is_some() {
                return Err(PlanDefect::DuplicateTask(task.id.clone()));
            }
        }

        let mut tasks = Vec::with_capacity(spec.tasks.len());
        for task in &spec.tasks {
            let mut depends_on = Vec::with_capacity(task.depends_on.len());
            for dep in &task.depends_on {
                let idx = index.get(dep.as_str()).copied().ok_or_else(|| {
                    PlanDefect::UnknownDependency {
                        task_id: task.id.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                if !depends_on.contains(&idx) {
                    depends_on.push(idx);
                }
            }

            let subplan = match &task.subplan {
                Some(nested) => Some(Arc::new(Self::build(nested, depth + 1, max_depth, has_agent)?)),
                None if !has_agent(&task.agent_id) => {
                    return Err(PlanDefect::MissingAgent {
                        task_id: task.id.clone(),
                        agent_id: task.agent_id.clone(),
                    })
                }
                None => None,
            };

            tasks.push(TaskNode {
                id: task.id.clone(),
                agent_id: task.agent_id.clone(),
                message: task.message.clone(),
                critical: task.critical,
                estimate: Usage::new(task.estimated_tokens, task.estimated_cost_usd),
                depends_on,
                dependents: Vec::new(),
                subplan,
            });
        }

        if let Some(synth) = &spec.synthesizer {
            if !has_agent(synth) {
                return Err(PlanDefect::MissingAgent {
                    task_id: "synthesis".to_string(),
                    agent_id: synth.clone(),
                });
            }
        }

        for i in 0..tasks.len() {
            for d in tasks[i].depends_on.clone() {
                tasks[d].dependents.push(i);
            }
        }

        let order = topological_order(&tasks)?;
        Ok(Self {
            tasks,
            order,
            synthesizer: spec.synthesizer.clone(),
            depth,
        })
    }

    pub fn tasks(&self) -> &[TaskNode] {
        &self.tasks
    }

    pub fn task(&self, idx: usize) -> &TaskNode {
        &self.tasks[idx]
    }

    /// Task indices in a dependency-respecting order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn synthesizer(&self) -> Option<&str> {
        self.synthesizer.as_deref()
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }
}

/// Kahn's algorithm; ties broken by declaration order.
fn topological_order(tasks: &[TaskNode]) -> Result<Vec<usize>, PlanDefect> {
    let mut indegree: Vec<usize> = tasks.iter().map(|t| t.depends_on.len()).collect();
    let mut queue: VecDeque<usize> = (0..tasks.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(tasks.len());

    while let Some(node) = queue.pop_front() {
        order.push(node);
        for &next in &tasks[node].dependents {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if order.len() != tasks.len() {
        let stuck = (0..tasks.len())
            .filter(|&i| indegree[i] > 0)
            .map(|i| tasks[i].id.clone())
            .collect();
        return Err(PlanDefect::Cycle(stuck));
    }
    Ok(order)
}
