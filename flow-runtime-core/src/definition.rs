//! Process definitions — the immutable element graph the interpreter walks.
//!
//! Definitions arrive pre-parsed (XML/JSON front-ends are external); this
//! module owns the in-memory model, deploy-time validation, the timer
//! dialect, and the structural reachability cache consumed by converging
//! inclusive gateways.

use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

// ─── Element kinds ────────────────────────────────────────────

/// Tagged element variant. One behavior function per kind — the interpreter
/// dispatches on this, never on runtime type tricks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    StartEvent,
    EndEvent,
    IntermediateCatchEvent,
    IntermediateThrowEvent,
    BoundaryEvent,
    ExclusiveGateway,
    ParallelGateway,
    InclusiveGateway,
    UserTask,
    ServiceTask,
    ScriptTask,
    SubProcess,
    EventSubProcess,
    Transaction,
}

impl ElementKind {
    /// Activities can host boundary events and register compensation
    /// handlers; gateways and events cannot.
    pub fn is_activity(&self) -> bool {
        matches!(
            self,
            ElementKind::UserTask
                | ElementKind::ServiceTask
                | ElementKind::ScriptTask
                | ElementKind::SubProcess
                | ElementKind::Transaction
        )
    }

    pub fn is_scope(&self) -> bool {
        matches!(
            self,
            ElementKind::SubProcess | ElementKind::EventSubProcess | ElementKind::Transaction
        )
    }
}

/// Event definition attached to start/end/catch/throw/boundary events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventDefinition {
    Signal { signal_ref: String },
    Message { message_ref: String },
    Timer { timer: TimerSpec },
    /// `error_ref: None` on a catching event means catch-all.
    Error { error_ref: Option<String> },
    Conditional { condition: String },
    /// On an end/throw event: compensate `activity_id` (or the whole
    /// enclosing scope when `None`). On a boundary event: marks the
    /// attachment point of a compensation handler.
    Compensation { activity_id: Option<String> },
    Terminate,
    Cancel,
}

impl EventDefinition {
    /// The subscription event name used for registry matching, if any.
    pub fn event_name(&self) -> Option<&str> {
        match self {
            EventDefinition::Signal { signal_ref } => Some(signal_ref),
            EventDefinition::Message { message_ref } => Some(message_ref),
            EventDefinition::Error { error_ref } => error_ref.as_deref(),
            _ => None,
        }
    }
}

// ─── Timer dialect ────────────────────────────────────────────

/// Parsed timer definition. The accepted dialect is fixed: ISO-8601
/// durations (`PT5M`, `P1DT2H30M`), repeating cycles (`R3/PT10S`, `R/PT1M`
/// for unbounded), and absolute RFC-3339 date-times. Cron strings are
/// rejected at deploy time, not at fire time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "timer_type", rename_all = "snake_case")]
pub enum TimerSpec {
    Duration {
        ms: u64,
    },
    Cycle {
        interval_ms: u64,
        /// `None` = unbounded repetition.
        repetitions: Option<u32>,
    },
    Date {
        at: DateTime<Utc>,
    },
}

impl TimerSpec {
    pub fn parse(input: &str) -> Result<TimerSpec> {
        let s = input.trim();
        if s.is_empty() {
            return Err(EngineError::Definition("empty timer definition".into()));
        }
        if let Some(rest) = s.strip_prefix('R') {
            let (count, dur) = rest
                .split_once('/')
                .ok_or_else(|| EngineError::Definition(format!("malformed timer cycle `{s}`")))?;
            let repetitions = if count.is_empty() {
                None
            } else {
                Some(count.parse::<u32>().map_err(|_| {
                    EngineError::Definition(format!("bad repetition count in `{s}`"))
                })?)
            };
            if repetitions == Some(0) {
                return Err(EngineError::Definition(format!(
                    "timer cycle `{s}` repeats zero times"
                )));
            }
            let interval_ms = parse_iso_duration_ms(dur)
                .ok_or_else(|| EngineError::Definition(format!("bad cycle duration in `{s}`")))?;
            return Ok(TimerSpec::Cycle {
                interval_ms,
                repetitions,
            });
        }
        if s.starts_with('P') {
            let ms = parse_iso_duration_ms(s)
                .ok_or_else(|| EngineError::Definition(format!("bad ISO-8601 duration `{s}`")))?;
            return Ok(TimerSpec::Duration { ms });
        }
        if let Ok(at) = DateTime::parse_from_rfc3339(s) {
            return Ok(TimerSpec::Date {
                at: at.with_timezone(&Utc),
            });
        }
        Err(EngineError::Definition(format!(
            "unsupported timer definition `{s}` (expected ISO-8601 duration, R[n]/duration cycle, or RFC-3339 date)"
        )))
    }

    /// Absolute due time for the next fire, given "now".
    pub fn due_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            TimerSpec::Duration { ms } => now + chrono::Duration::milliseconds(*ms as i64),
            TimerSpec::Cycle { interval_ms, .. } => {
                now + chrono::Duration::milliseconds(*interval_ms as i64)
            }
            TimerSpec::Date { at } => *at,
        }
    }
}

/// Parse `PnDTnHnMnS` (with optional fractional seconds) into milliseconds.
/// Returns `None` on anything malformed or empty.
fn parse_iso_duration_ms(s: &str) -> Option<u64> {
    let body = s.strip_prefix('P')?;
    let (date_part, time_part) = match body.split_once('T') {
        Some((d, t)) => (d, t),
        None => (body, ""),
    };
    if date_part.is_empty() && time_part.is_empty() {
        return None;
    }
    let mut total_ms: u64 = 0;
    let mut consume = |part: &str, units: &[(char, u64)]| -> Option<()> {
        let mut num = String::new();
        for c in part.chars() {
            if c.is_ascii_digit() || c == '.' {
                num.push(c);
            } else {
                let (_, ms_per) = units.iter().find(|(u, _)| *u == c)?;
                let v: f64 = num.parse().ok()?;
                total_ms += (v * *ms_per as f64) as u64;
                num.clear();
            }
        }
        if num.is_empty() {
            Some(())
        } else {
            None
        }
    };
    consume(
        date_part,
        &[
            ('Y', 365 * 24 * 3_600_000),
            ('M', 30 * 24 * 3_600_000),
            ('W', 7 * 24 * 3_600_000),
            ('D', 24 * 3_600_000),
        ],
    )?;
    consume(time_part, &[('H', 3_600_000), ('M', 60_000), ('S', 1_000)])?;
    Some(total_ms)
}

// ─── Elements and flows ───────────────────────────────────────

/// Retry policy for service/script task execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

/// One node in the process graph. Elements refer to siblings only by id;
/// the definition owns all of them, including those nested in sub-processes
/// (flattened, with `container` pointing at the owning scope element).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Element {
    pub id: String,
    pub kind: ElementKind,
    pub name: Option<String>,
    /// Incoming sequence-flow ids (derived from flows at build time).
    #[serde(default)]
    pub incoming: Vec<String>,
    /// Outgoing sequence-flow ids, in author-declared order.
    #[serde(default)]
    pub outgoing: Vec<String>,
    /// Owning sub-process element id; `None` for top-level elements.
    pub container: Option<String>,
    pub event: Option<EventDefinition>,
    /// Boundary events and event-sub-process start events: whether firing
    /// interrupts the host. Defaults to interrupting.
    #[serde(default = "default_true")]
    pub interrupting: bool,
    /// Activity id of this element's compensation handler, if declared.
    pub compensation_handler: Option<String>,
    /// Host activity id for boundary events.
    pub attached_to: Option<String>,
    /// Flow id taken by an exclusive/inclusive gateway when no condition
    /// evaluates true.
    pub default_flow: Option<String>,
    /// Handler key for service tasks.
    pub task_type: Option<String>,
    /// Expression evaluated by script tasks.
    pub script: Option<String>,
    /// Variable receiving the script result.
    pub result_variable: Option<String>,
    pub retries: Option<RetryPolicy>,
    pub assignee: Option<String>,
    #[serde(default)]
    pub candidate_groups: Vec<String>,
    /// Expression yielding the user-task due date.
    pub due_date: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Element {
    pub fn new(id: impl Into<String>, kind: ElementKind) -> Self {
        Self {
            id: id.into(),
            kind,
            name: None,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            container: None,
            event: None,
            interrupting: true,
            compensation_handler: None,
            attached_to: None,
            default_flow: None,
            task_type: None,
            script: None,
            result_variable: None,
            retries: None,
            assignee: None,
            candidate_groups: Vec::new(),
            due_date: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn in_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    pub fn with_event(mut self, event: EventDefinition) -> Self {
        self.event = Some(event);
        self
    }

    pub fn non_interrupting(mut self) -> Self {
        self.interrupting = false;
        self
    }

    pub fn attached(mut self, host: impl Into<String>) -> Self {
        self.attached_to = Some(host.into());
        self
    }

    pub fn compensated_by(mut self, handler: impl Into<String>) -> Self {
        self.compensation_handler = Some(handler.into());
        self
    }

    pub fn with_default_flow(mut self, flow: impl Into<String>) -> Self {
        self.default_flow = Some(flow.into());
        self
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_script(mut self, script: impl Into<String>, result: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self.result_variable = Some(result.into());
        self
    }

    pub fn with_retries(mut self, max_attempts: u32, backoff_ms: u64) -> Self {
        self.retries = Some(RetryPolicy {
            max_attempts,
            backoff_ms,
        });
        self
    }

    pub fn with_assignee(mut self, assignee: impl Into<String>) -> Self {
        self.assignee = Some(assignee.into());
        self
    }
}

/// Directed edge between two elements, with an optional boolean condition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub id: String,
    pub source: String,
    pub target: String,
    pub condition: Option<String>,
}

// ─── Process definition ───────────────────────────────────────

/// Immutable, validated process graph. Built once at deploy time; the
/// interpreter only reads it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: Uuid,
    pub key: String,
    pub version: i32,
    pub name: Option<String>,
    pub tenant_id: Option<String>,
    elements: BTreeMap<String, Element>,
    flows: BTreeMap<String, SequenceFlow>,
    /// element id → every element that can still send a token there.
    /// Computed once at deploy; converging inclusive gateways read it.
    upstream: BTreeMap<String, BTreeSet<String>>,
    pub fingerprint: [u8; 32],
}

impl ProcessDefinition {
    pub fn element(&self, id: &str) -> Result<&Element> {
        self.elements
            .get(id)
            .ok_or_else(|| EngineError::not_found("element", id))
    }

    pub fn flow(&self, id: &str) -> Result<&SequenceFlow> {
        self.flows
            .get(id)
            .ok_or_else(|| EngineError::not_found("sequence flow", id))
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.elements.values()
    }

    /// Direct children of a container (`None` = process root), boundary
    /// events excluded.
    pub fn children_of(&self, container: Option<&str>) -> Vec<&Element> {
        self.elements
            .values()
            .filter(|e| e.container.as_deref() == container && e.attached_to.is_none())
            .collect()
    }

    /// Start events of a container, in id order.
    pub fn start_events(&self, container: Option<&str>) -> Vec<&Element> {
        self.children_of(container)
            .into_iter()
            .filter(|e| e.kind == ElementKind::StartEvent)
            .collect()
    }

    /// Boundary events attached to the given activity.
    pub fn boundary_events_of(&self, activity_id: &str) -> Vec<&Element> {
        self.elements
            .values()
            .filter(|e| e.attached_to.as_deref() == Some(activity_id))
            .collect()
    }

    /// Event sub-processes directly inside a container.
    pub fn event_subprocesses_of(&self, container: Option<&str>) -> Vec<&Element> {
        self.children_of(container)
            .into_iter()
            .filter(|e| e.kind == ElementKind::EventSubProcess)
            .collect()
    }

    /// Outgoing flows of an element, in declaration order.
    pub fn outgoing_flows(&self, element: &Element) -> Vec<&SequenceFlow> {
        element
            .outgoing
            .iter()
            .filter_map(|id| self.flows.get(id))
            .collect()
    }

    /// True if `from` can still deliver a token to `to` (flows plus
    /// host→boundary edges). Reflexive.
    pub fn reaches(&self, from: &str, to: &str) -> bool {
        from == to
            || self
                .upstream
                .get(to)
                .map(|set| set.contains(from))
                .unwrap_or(false)
    }
}

// ─── Builder ──────────────────────────────────────────────────

/// Assembles and validates a [`ProcessDefinition`]. Incoming/outgoing flow
/// lists are derived here — authors declare flows only.
pub struct DefinitionBuilder {
    key: String,
    name: Option<String>,
    tenant_id: Option<String>,
    version: i32,
    elements: Vec<Element>,
    flows: Vec<SequenceFlow>,
}

impl DefinitionBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: None,
            tenant_id: None,
            version: 1,
            elements: Vec::new(),
            flows: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    pub fn element(mut self, element: Element) -> Self {
        self.elements.push(element);
        self
    }

    pub fn flow(mut self, id: &str, source: &str, target: &str) -> Self {
        self.flows.push(SequenceFlow {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition: None,
        });
        self
    }

    pub fn conditional_flow(mut self, id: &str, source: &str, target: &str, cond: &str) -> Self {
        self.flows.push(SequenceFlow {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition: Some(cond.into()),
        });
        self
    }

    pub fn build(self) -> Result<ProcessDefinition> {
        let mut elements: BTreeMap<String, Element> = BTreeMap::new();
        for e in self.elements {
            if elements.insert(e.id.clone(), e).is_some() {
                return Err(EngineError::Definition("duplicate element id".into()));
            }
        }
        let mut flows: BTreeMap<String, SequenceFlow> = BTreeMap::new();
        for f in self.flows {
            if !elements.contains_key(&f.source) {
                return Err(EngineError::Definition(format!(
                    "flow `{}` references unknown source `{}`",
                    f.id, f.source
                )));
            }
            if !elements.contains_key(&f.target) {
                return Err(EngineError::Definition(format!(
                    "flow `{}` references unknown target `{}`",
                    f.id, f.target
                )));
            }
            if flows.insert(f.id.clone(), f).is_some() {
                return Err(EngineError::Definition("duplicate flow id".into()));
            }
        }

        // Derive incoming/outgoing, preserving flow declaration order.
        for flow in flows.values() {
            elements
                .get_mut(&flow.source)
                .unwrap()
                .outgoing
                .push(flow.id.clone());
            elements
                .get_mut(&flow.target)
                .unwrap()
                .incoming
                .push(flow.id.clone());
        }

        validate(&elements, &flows)?;

        let upstream = compute_upstream(&elements, &flows);
        let fingerprint = fingerprint(&self.key, &elements, &flows);

        Ok(ProcessDefinition {
            id: Uuid::now_v7(),
            key: self.key,
            version: self.version,
            name: self.name,
            tenant_id: self.tenant_id,
            elements,
            flows,
            upstream,
            fingerprint,
        })
    }
}

// ─── Validation ───────────────────────────────────────────────

fn validate(
    elements: &BTreeMap<String, Element>,
    flows: &BTreeMap<String, SequenceFlow>,
) -> Result<()> {
    let err = |msg: String| Err(EngineError::Definition(msg));

    // At least one start event at the process root.
    let root_starts = elements
        .values()
        .filter(|e| e.container.is_none() && e.kind == ElementKind::StartEvent)
        .count();
    if root_starts == 0 {
        return err("process has no start event".into());
    }

    for e in elements.values() {
        if let Some(container) = &e.container {
            let owner = elements
                .get(container)
                .ok_or_else(|| EngineError::Definition(format!(
                    "element `{}` nested in unknown container `{}`",
                    e.id, container
                )))?;
            if !owner.kind.is_scope() {
                return err(format!(
                    "element `{}` nested in non-scope element `{}`",
                    e.id, owner.id
                ));
            }
        }

        match e.kind {
            ElementKind::EventSubProcess => {
                if !e.incoming.is_empty() || !e.outgoing.is_empty() {
                    return err(format!(
                        "event sub-process `{}` must not have sequence flows",
                        e.id
                    ));
                }
                let starts: Vec<&Element> = elements
                    .values()
                    .filter(|c| {
                        c.container.as_deref() == Some(e.id.as_str())
                            && c.kind == ElementKind::StartEvent
                    })
                    .collect();
                if starts.is_empty() {
                    return err(format!("event sub-process `{}` has no start event", e.id));
                }
                for s in starts {
                    if s.event.is_none() {
                        return err(format!(
                            "start event `{}` of event sub-process `{}` carries no event definition",
                            s.id, e.id
                        ));
                    }
                }
            }
            ElementKind::BoundaryEvent => {
                let host_id = e.attached_to.as_deref().ok_or_else(|| {
                    EngineError::Definition(format!("boundary event `{}` is not attached", e.id))
                })?;
                let host = elements.get(host_id).ok_or_else(|| {
                    EngineError::Definition(format!(
                        "boundary event `{}` attached to unknown activity `{}`",
                        e.id, host_id
                    ))
                })?;
                if !host.kind.is_activity() {
                    return err(format!(
                        "boundary event `{}` attached to non-activity `{}`",
                        e.id, host_id
                    ));
                }
                if e.event.is_none() {
                    return err(format!(
                        "boundary event `{}` carries no event definition",
                        e.id
                    ));
                }
                if !e.incoming.is_empty() {
                    return err(format!(
                        "boundary event `{}` must not have incoming flows",
                        e.id
                    ));
                }
            }
            ElementKind::StartEvent => {
                if !e.incoming.is_empty() {
                    return err(format!("start event `{}` has incoming flows", e.id));
                }
            }
            ElementKind::EndEvent => {
                if !e.outgoing.is_empty() {
                    return err(format!("end event `{}` has outgoing flows", e.id));
                }
                if matches!(e.event, Some(EventDefinition::Cancel)) {
                    let in_transaction = e
                        .container
                        .as_deref()
                        .and_then(|c| elements.get(c))
                        .map(|c| c.kind == ElementKind::Transaction)
                        .unwrap_or(false);
                    if !in_transaction {
                        return err(format!(
                            "cancel end event `{}` outside a transaction sub-process",
                            e.id
                        ));
                    }
                }
            }
            ElementKind::ServiceTask => {
                if e.task_type.is_none() {
                    return err(format!("service task `{}` declares no task type", e.id));
                }
            }
            ElementKind::ScriptTask => {
                if e.script.is_none() {
                    return err(format!("script task `{}` declares no script", e.id));
                }
            }
            ElementKind::SubProcess | ElementKind::Transaction => {
                let has_start = elements.values().any(|c| {
                    c.container.as_deref() == Some(e.id.as_str())
                        && c.kind == ElementKind::StartEvent
                });
                if !has_start {
                    return err(format!("sub-process `{}` has no start event", e.id));
                }
            }
            _ => {}
        }

        if let Some(default_flow) = &e.default_flow {
            if !e.outgoing.contains(default_flow) {
                return err(format!(
                    "default flow `{}` of `{}` is not one of its outgoing flows",
                    default_flow, e.id
                ));
            }
        }

        if let Some(handler_id) = &e.compensation_handler {
            let handler = elements.get(handler_id).ok_or_else(|| {
                EngineError::Definition(format!(
                    "compensation handler `{}` of `{}` does not exist",
                    handler_id, e.id
                ))
            })?;
            if !handler.kind.is_activity() {
                return err(format!(
                    "compensation handler `{}` of `{}` is not an activity",
                    handler_id, e.id
                ));
            }
        }

        // Expressions and timers must be well-formed before anything runs.
        if let Some(EventDefinition::Conditional { condition }) = &e.event {
            crate::expr::parse(condition)?;
        }
    }

    for flow in flows.values() {
        let source = &elements[&flow.source];
        let target = &elements[&flow.target];
        if source.container != target.container {
            return err(format!(
                "flow `{}` crosses scope boundary ({} → {})",
                flow.id, flow.source, flow.target
            ));
        }
        if let Some(condition) = &flow.condition {
            crate::expr::parse(condition)?;
        }
    }

    Ok(())
}

// ─── Reachability cache ───────────────────────────────────────

/// Fixed-point forward walk: for every element, record everything it can
/// reach over sequence flows plus host→boundary attachment edges. Stored
/// inverted (target → sources) because the inclusive join asks "who can
/// still reach me".
fn compute_upstream(
    elements: &BTreeMap<String, Element>,
    flows: &BTreeMap<String, SequenceFlow>,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut successors: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for flow in flows.values() {
        successors
            .entry(flow.source.as_str())
            .or_default()
            .push(flow.target.as_str());
    }
    for e in elements.values() {
        if let Some(host) = &e.attached_to {
            successors.entry(host.as_str()).or_default().push(&e.id);
        }
    }

    let mut upstream: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for start in elements.keys() {
        let mut stack: Vec<&str> = vec![start.as_str()];
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        while let Some(node) = stack.pop() {
            for next in successors.get(node).into_iter().flatten() {
                if seen.insert(next) {
                    upstream
                        .entry((*next).to_string())
                        .or_default()
                        .insert(start.clone());
                    stack.push(next);
                }
            }
        }
    }
    upstream
}

fn fingerprint(
    key: &str,
    elements: &BTreeMap<String, Element>,
    flows: &BTreeMap<String, SequenceFlow>,
) -> [u8; 32] {
    let canonical = serde_json::json!({
        "key": key,
        "elements": elements,
        "flows": flows,
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hasher.finalize().into()
}
