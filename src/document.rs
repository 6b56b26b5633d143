//! Read-only document model (C1): the state/transition graph produced by an
//! external SCXML parser and consumed by every other component in this
//! crate. Nodes live in a flat arena and are addressed by index, mirroring
//! the arena-of-indices approach the rest of this crate uses for the active
//! configuration and history store.

use std::collections::HashMap;

use crate::error::SessionError;

/// Index into [`Document`]'s state arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub(crate) u32);

/// Index into [`Document`]'s transition arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransitionId(pub(crate) u32);

impl StateId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl TransitionId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Shallow history remembers the direct child active under a state; deep
/// history remembers every active descendant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryType {
    Shallow,
    Deep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Atomic,
    Compound,
    Parallel,
    Final,
    History(HistoryType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    External,
    Internal,
}

/// One `<send>` target; resolved at action-execution time, not here.
#[derive(Debug, Clone)]
pub struct SendAction {
    pub id: Option<String>,
    pub idlocation: Option<String>,
    pub event: Option<String>,
    pub eventexpr: Option<String>,
    pub target: Option<String>,
    pub targetexpr: Option<String>,
    pub type_: Option<String>,
    pub delay_ms: u64,
    pub namelist: Vec<String>,
    pub params: Vec<Param>,
    pub content: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IfBranch {
    pub cond: Option<String>,
    pub actions: Vec<Action>,
}

/// One piece of executable content. A [`Block`] is an ordered list of these;
/// blocks themselves are never flattened into one another (§4.5.1).
#[derive(Debug, Clone)]
pub enum Action {
    Raise { event: String },
    Send(SendAction),
    Cancel { sendid: Option<String>, sendidexpr: Option<String> },
    Assign { location: String, expr: String },
    Script { src: String },
    Log { label: Option<String>, expr: Option<String> },
    If(Vec<IfBranch>),
    Foreach { array: String, item: String, index: Option<String>, actions: Vec<Action> },
}

pub type Block = Vec<Action>;

#[derive(Debug, Clone)]
pub struct DataItem {
    pub id: String,
    pub expr: Option<String>,
    pub src: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub location: String,
    pub expr: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ContentExpr {
    pub expr: Option<String>,
    pub inline: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DoneData {
    pub content: Option<ContentExpr>,
    pub params: Vec<Param>,
}

#[derive(Debug, Clone)]
pub struct InvokeDecl {
    pub id: Option<String>,
    pub idlocation: Option<String>,
    pub type_: String,
    pub src: Option<String>,
    pub srcexpr: Option<String>,
    pub autoforward: bool,
    pub namelist: Vec<String>,
    pub params: Vec<Param>,
    pub content: Option<String>,
    pub finalize: Vec<Action>,
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub id: TransitionId,
    pub source: StateId,
    pub events: Vec<String>,
    pub guard: Option<String>,
    pub targets: Vec<StateId>,
    pub kind: TransitionKind,
    pub actions: Vec<Action>,
    pub doc_order: u32,
}

impl Transition {
    #[inline]
    pub fn is_eventless(&self) -> bool {
        self.events.is_empty()
    }

    #[inline]
    pub fn is_targetless(&self) -> bool {
        self.targets.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct StateNode {
    pub id: StateId,
    pub sid: String,
    pub kind: StateKind,
    pub parent: Option<StateId>,
    pub children: Vec<StateId>,
    pub transitions: Vec<TransitionId>,
    pub onentry: Vec<Block>,
    pub onexit: Vec<Block>,
    pub datamodel: Vec<DataItem>,
    pub invokes: Vec<InvokeDecl>,
    pub donedata: Option<DoneData>,
    pub initial: Vec<StateId>,
    pub doc_order: u32,
}

impl StateNode {
    #[inline]
    pub fn is_history(&self) -> bool {
        matches!(self.kind, StateKind::History(_))
    }

    #[inline]
    pub fn is_atomic_leaf(&self) -> bool {
        matches!(self.kind, StateKind::Atomic | StateKind::Final) && self.children.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingMode {
    Early,
    Late,
}

/// The read-only, pre-order-indexed state graph. Built once via
/// [`DocumentBuilder`] and shared (by reference) across every session that
/// interprets it.
#[derive(Debug)]
pub struct Document {
    states: Vec<StateNode>,
    transitions: Vec<Transition>,
    by_sid: HashMap<String, StateId>,
    root: StateId,
    top_level_scripts: Vec<Action>,
    binding_mode: BindingMode,
    name: Option<String>,
}

impl Document {
    #[inline]
    pub fn state(&self, id: StateId) -> &StateNode {
        &self.states[id.index()]
    }

    #[inline]
    pub fn transition(&self, id: TransitionId) -> &Transition {
        &self.transitions[id.index()]
    }

    #[inline]
    pub fn get_root_state(&self) -> StateId {
        self.root
    }

    #[inline]
    pub fn get_all_states(&self) -> &[StateNode] {
        &self.states
    }

    #[inline]
    pub fn get_top_level_scripts(&self) -> &[Action] {
        &self.top_level_scripts
    }

    #[inline]
    pub fn get_binding_mode(&self) -> BindingMode {
        self.binding_mode
    }

    #[inline]
    pub fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn find_state_by_id(&self, sid: &str) -> Option<StateId> {
        self.by_sid.get(sid).copied()
    }

    /// `<scxml initial="...">`, or the root's own `initial` if parallel/implicit.
    pub fn get_initial_states(&self) -> &[StateId] {
        &self.state(self.root).initial
    }
}

/// Incrementally-built, not-yet-validated state graph. Mirrors the shape an
/// external XML parser would hand off: states and transitions are added with
/// string-based parent/target references, then [`build`](Self::build)
/// resolves them into index-based links and assigns document order.
pub struct DocumentBuilder {
    states: Vec<PendingState>,
    transitions: Vec<PendingTransition>,
    top_level_scripts: Vec<Action>,
    binding_mode: BindingMode,
    name: Option<String>,
}

struct PendingState {
    sid: String,
    kind: StateKind,
    parent: Option<String>,
    initial: Vec<String>,
    onentry: Vec<Block>,
    onexit: Vec<Block>,
    datamodel: Vec<DataItem>,
    invokes: Vec<InvokeDecl>,
    donedata: Option<DoneData>,
}

struct PendingTransition {
    source: String,
    events: Vec<String>,
    guard: Option<String>,
    targets: Vec<String>,
    kind: TransitionKind,
    actions: Vec<Action>,
}

impl Default for DocumentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentBuilder {
    pub fn new() -> Self {
        Self {
            states: Vec::new(),
            transitions: Vec::new(),
            top_level_scripts: Vec::new(),
            binding_mode: BindingMode::Early,
            name: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn binding_mode(mut self, mode: BindingMode) -> Self {
        self.binding_mode = mode;
        self
    }

    pub fn top_level_script(mut self, action: Action) -> Self {
        self.top_level_scripts.push(action);
        self
    }

    #[allow(clippy::too_many_arguments)]
    pub fn state(
        mut self,
        sid: impl Into<String>,
        kind: StateKind,
        parent: Option<&str>,
        initial: Vec<&str>,
        onentry: Vec<Block>,
        onexit: Vec<Block>,
        datamodel: Vec<DataItem>,
        invokes: Vec<InvokeDecl>,
        donedata: Option<DoneData>,
    ) -> Self {
        self.states.push(PendingState {
            sid: sid.into(),
            kind,
            parent: parent.map(|s| s.to_string()),
            initial: initial.into_iter().map(|s| s.to_string()).collect(),
            onentry,
            onexit,
            datamodel,
            invokes,
            donedata,
        });
        self
    }

    pub fn transition(
        mut self,
        source: impl Into<String>,
        events: Vec<&str>,
        guard: Option<&str>,
        targets: Vec<&str>,
        kind: TransitionKind,
        actions: Vec<Action>,
    ) -> Self {
        self.transitions.push(PendingTransition {
            source: source.into(),
            events: events.into_iter().map(|s| s.to_string()).collect(),
            guard: guard.map(|s| s.to_string()),
            targets: targets.into_iter().map(|s| s.to_string()).collect(),
            kind,
            actions,
        });
        self
    }

    pub fn build(self) -> Result<Document, SessionError> {
        let mut by_sid = HashMap::new();
        let mut states = Vec::with_capacity(self.states.len());

        for (idx, pending) in self.states.iter().enumerate() {
            if by_sid
                .insert(pending.sid.clone(), StateId(idx as u32))
                .is_some()
            {
                return Err(SessionError::MalformedDocument(format!(
                    "duplicate state id '{}'",
                    pending.sid
                )));
            }
            states.push(StateNode {
                id: StateId(idx as u32),
                sid: pending.sid.clone(),
                kind: pending.kind,
                parent: None,
                children: Vec::new(),
                transitions: Vec::new(),
                onentry: pending.onentry.clone(),
                onexit: pending.onexit.clone(),
                datamodel: pending.datamodel.clone(),
                invokes: pending.invokes.clone(),
                donedata: pending.donedata.clone(),
                initial: Vec::new(),
                doc_order: 0,
            });
        }

        let resolve = |sid: &str, by_sid: &HashMap<String, StateId>| -> Result<StateId, SessionError> {
            by_sid
                .get(sid)
                .copied()
                .ok_or_else(|| SessionError::MalformedDocument(format!("unresolved state reference '{sid}'")))
        };

        for (idx, pending) in self.states.iter().enumerate() {
            if let Some(parent_sid) = &pending.parent {
                let parent_id = resolve(parent_sid, &by_sid)?;
                states[idx].parent = Some(parent_id);
                states[parent_id.index()].children.push(StateId(idx as u32));
            }
            for initial_sid in &pending.initial {
                states[idx].initial.push(resolve(initial_sid, &by_sid)?);
            }
        }

        // Cycle detection: every non-root state must reach the (unique) root
        // via a bounded number of `parent` hops.
        let roots: Vec<StateId> = states
            .iter()
            .filter(|s| s.parent.is_none())
            .map(|s| s.id)
            .collect();
        if roots.len() != 1 {
            return Err(SessionError::MalformedDocument(format!(
                "document must have exactly one root state, found {}",
                roots.len()
            )));
        }
        let root = roots[0];
        for state in &states {
            let mut cursor = state.id;
            let mut hops = 0usize;
            while let Some(parent) = states[cursor.index()].parent {
                cursor = parent;
                hops += 1;
                if hops > states.len() {
                    return Err(SessionError::MalformedDocument(format!(
                        "cyclic parent chain detected at state '{}'",
                        state.sid
                    )));
                }
            }
            if cursor != root {
                return Err(SessionError::MalformedDocument(format!(
                    "state '{}' does not resolve to the document root",
                    state.sid
                )));
            }
        }

        let mut transitions = Vec::with_capacity(self.transitions.len());
        for (idx, pending) in self.transitions.into_iter().enumerate() {
            let source = resolve(&pending.source, &by_sid)?;
            let mut targets = Vec::with_capacity(pending.targets.len());
            for t in &pending.targets {
                targets.push(resolve(t, &by_sid)?);
            }
            let tid = TransitionId(idx as u32);
            states[source.index()].transitions.push(tid);
            transitions.push(Transition {
                id: tid,
                source,
                events: pending.events,
                guard: pending.guard,
                targets,
                kind: pending.kind,
                actions: pending.actions,
                doc_order: 0, // assigned below, alongside state doc_order
            });
        }

        // Pre-order traversal assigns document order to both states and the
        // transitions hanging off them, in one pass.
        let mut order = 0u32;
        let mut stack = vec![root];
        let mut doc_order_of = HashMap::new();
        // iterative pre-order, children visited in declaration order
        fn visit(
            states: &mut [StateNode],
            transitions: &mut [Transition],
            id: StateId,
            order: &mut u32,
            doc_order_of: &mut HashMap<StateId, u32>,
        ) {
            states[id.index()].doc_order = *order;
            doc_order_of.insert(id, *order);
            *order += 1;
            for tid in states[id.index()].transitions.clone() {
                transitions[tid.index()].doc_order = *order;
                *order += 1;
            }
            for child in states[id.index()].children.clone() {
                visit(states, transitions, child, order, doc_order_of);
            }
        }
        stack.clear();
        visit(&mut states, &mut transitions, root, &mut order, &mut doc_order_of);

        for node in &states {
            if let StateKind::History(_) = node.kind {
                if node.initial.is_empty() {
                    return Err(SessionError::MalformedDocument(format!(
                        "history state '{}' has no default transition target",
                        node.sid
                    )));
                }
            }
        }

        Ok(Document {
            states,
            transitions,
            by_sid,
            root,
            top_level_scripts: self.top_level_scripts,
            binding_mode: self.binding_mode,
            name: self.name,
        })
    }
}
