use std::collections::{HashMap, HashSet};
use std::error::Error as StdError;
use std::fmt;
use std::rc::Rc;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    SelectorNotFound(String),
    UnsupportedSelector(String),
    TypeMismatch {
        selector: String,
        expected: String,
        actual: String,
    },
    AssertionFailed {
        selector: String,
        expected: String,
        actual: String,
        dom_snippet: String,
    },
    HostState(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelectorNotFound(selector) => write!(f, "selector not found: {selector}"),
            Self::UnsupportedSelector(selector) => write!(f, "unsupported selector: {selector}"),
            Self::TypeMismatch {
                selector,
                expected,
                actual,
            } => write!(
                f,
                "type mismatch for {selector}: expected {expected}, actual {actual}"
            ),
            Self::AssertionFailed {
                selector,
                expected,
                actual,
                dom_snippet,
            } => write!(
                f,
                "assertion failed for {selector}: expected {expected}, actual {actual}, snippet {dom_snippet}"
            ),
            Self::HostState(msg) => write!(f, "host state error: {msg}"),
        }
    }
}

impl StdError for Error {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
enum NodeType {
    Document,
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone)]
struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    node_type: NodeType,
}

#[derive(Debug, Clone)]
struct Element {
    tag_name: String,
    attrs: HashMap<String, String>,
    value: String,
    checked: bool,
    default_value: String,
    default_checked: bool,
    disabled: bool,
    readonly: bool,
    value_dirty: bool,
    checked_dirty: bool,
}

impl Element {
    fn new(tag_name: String) -> Self {
        Self {
            tag_name,
            attrs: HashMap::new(),
            value: String::new(),
            checked: false,
            default_value: String::new(),
            default_checked: false,
            disabled: false,
            readonly: false,
            value_dirty: false,
            checked_dirty: false,
        }
    }

    fn input_kind(&self) -> &str {
        self.attrs.get("type").map(String::as_str).unwrap_or("text")
    }
}

const fn bool_str(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

fn is_form_control_tag(tag: &str) -> bool {
    tag.eq_ignore_ascii_case("input") || tag.eq_ignore_ascii_case("textarea")
}

fn is_date_kind(kind: &str) -> bool {
    matches!(kind, "date" | "time" | "datetime-local" | "month" | "week")
}

#[derive(Debug)]
struct Dom {
    nodes: Vec<Node>,
    root: NodeId,
    id_index: HashMap<String, NodeId>,
}

impl Dom {
    fn new() -> Self {
        let root = Node {
            parent: None,
            children: Vec::new(),
            node_type: NodeType::Document,
        };
        Self {
            nodes: vec![root],
            root: NodeId(0),
            id_index: HashMap::new(),
        }
    }

    fn create_node(&mut self, parent: NodeId, index: usize, node_type: NodeType) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            parent: Some(parent),
            children: Vec::new(),
            node_type,
        });
        let siblings = &mut self.nodes[parent.0].children;
        let at = index.min(siblings.len());
        siblings.insert(at, id);
        id
    }

    fn create_element(&mut self, parent: NodeId, index: usize, tag_name: &str) -> NodeId {
        self.create_node(
            parent,
            index,
            NodeType::Element(Element::new(tag_name.to_ascii_lowercase())),
        )
    }

    fn create_text(&mut self, parent: NodeId, index: usize, text: &str) -> NodeId {
        self.create_node(parent, index, NodeType::Text(text.to_string()))
    }

    fn detach(&mut self, node: NodeId) {
        if let Some(parent) = self.nodes[node.0].parent {
            self.nodes[parent.0].children.retain(|child| *child != node);
        }
        self.nodes[node.0].parent = None;
    }

    fn element(&self, node: NodeId) -> Option<&Element> {
        match &self.nodes[node.0].node_type {
            NodeType::Element(element) => Some(element),
            _ => None,
        }
    }

    fn element_mut(&mut self, node: NodeId) -> Option<&mut Element> {
        match &mut self.nodes[node.0].node_type {
            NodeType::Element(element) => Some(element),
            _ => None,
        }
    }

    fn tag_name(&self, node: NodeId) -> Option<&str> {
        self.element(node).map(|element| element.tag_name.as_str())
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes[node.0].parent
    }

    fn children(&self, node: NodeId) -> &[NodeId] {
        &self.nodes[node.0].children
    }

    fn attr(&self, node: NodeId, name: &str) -> Option<&str> {
        self.element(node)
            .and_then(|element| element.attrs.get(name))
            .map(String::as_str)
    }

    fn value_of(&self, node: NodeId) -> String {
        self.element(node)
            .map(|element| element.value.clone())
            .unwrap_or_default()
    }

    fn checked_of(&self, node: NodeId) -> bool {
        self.element(node).is_some_and(|element| element.checked)
    }

    fn default_value_of(&self, node: NodeId) -> String {
        self.element(node)
            .map(|element| element.default_value.clone())
            .unwrap_or_default()
    }

    fn disabled(&self, node: NodeId) -> bool {
        self.element(node).is_some_and(|element| element.disabled)
    }

    fn readonly(&self, node: NodeId) -> bool {
        self.element(node).is_some_and(|element| element.readonly)
    }

    fn is_form_control(&self, node: NodeId) -> bool {
        self.tag_name(node).is_some_and(is_form_control_tag)
    }

    fn is_checkbox(&self, node: NodeId) -> bool {
        self.element(node)
            .is_some_and(|element| element.tag_name == "input" && element.input_kind() == "checkbox")
    }

    fn is_radio(&self, node: NodeId) -> bool {
        self.element(node)
            .is_some_and(|element| element.tag_name == "input" && element.input_kind() == "radio")
    }

    fn form_owner(&self, node: NodeId) -> Option<NodeId> {
        let mut cursor = Some(node);
        while let Some(current) = cursor {
            if self
                .tag_name(current)
                .is_some_and(|tag| tag.eq_ignore_ascii_case("form"))
            {
                return Some(current);
            }
            cursor = self.parent(current);
        }
        None
    }

    fn all_element_nodes(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![self.root];
        while let Some(node) = stack.pop() {
            if self.element(node).is_some() {
                out.push(node);
            }
            for child in self.nodes[node.0].children.iter().rev() {
                stack.push(*child);
            }
        }
        out
    }

    fn radio_group_peers(&self, node: NodeId) -> Vec<NodeId> {
        let name = self.attr(node, "name").unwrap_or_default().to_string();
        if name.is_empty() {
            return Vec::new();
        }
        let owner = self.form_owner(node);
        self.all_element_nodes()
            .into_iter()
            .filter(|peer| {
                *peer != node
                    && self.is_radio(*peer)
                    && self.attr(*peer, "name").unwrap_or_default() == name
                    && self.form_owner(*peer) == owner
            })
            .collect()
    }

    fn set_id(&mut self, node: NodeId, id: Option<&str>) {
        let previous = self
            .element(node)
            .and_then(|element| element.attrs.get("id").cloned());
        if let Some(old) = previous {
            if self.id_index.get(&old) == Some(&node) {
                self.id_index.remove(&old);
            }
        }
        if let Some(element) = self.element_mut(node) {
            match id {
                Some(id) => {
                    element.attrs.insert("id".to_string(), id.to_string());
                }
                None => {
                    element.attrs.remove("id");
                }
            }
        }
        if let Some(id) = id {
            self.id_index.insert(id.to_string(), node);
        }
    }

    fn set_value_raw(&mut self, node: NodeId, value: &str, mark_dirty: bool) {
        if let Some(element) = self.element_mut(node) {
            element.value = value.to_string();
            if mark_dirty {
                element.value_dirty = true;
            }
        }
    }

    fn set_checked_raw(&mut self, node: NodeId, checked: bool, mark_dirty: bool) {
        if let Some(element) = self.element_mut(node) {
            element.checked = checked;
            if mark_dirty {
                element.checked_dirty = true;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Prop,
    Attr,
    AttrRemove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeWrite {
    pub node: NodeId,
    pub kind: WriteKind,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Null,
    Str(String),
    Num(f64),
    Bool(bool),
}

impl PropValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Str(s) => write!(f, "{s}"),
            Self::Num(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for PropValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for PropValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<f64> for PropValue {
    fn from(value: f64) -> Self {
        Self::Num(value)
    }
}

impl From<i32> for PropValue {
    fn from(value: i32) -> Self {
        Self::Num(f64::from(value))
    }
}

impl From<bool> for PropValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventSnapshot {
    pub event_type: String,
    pub target: NodeId,
    pub value: String,
    pub checked: bool,
}

pub type Handler = dyn Fn(&mut Runtime, &EventSnapshot) -> Result<()>;

#[derive(Clone, Default)]
pub struct Props {
    pub id: Option<String>,
    pub kind: Option<String>,
    pub name: Option<String>,
    pub value: Option<PropValue>,
    pub checked: Option<PropValue>,
    pub default_value: Option<PropValue>,
    pub default_checked: Option<bool>,
    pub min: Option<PropValue>,
    pub max: Option<PropValue>,
    pub step: Option<PropValue>,
    pub read_only: bool,
    pub disabled: bool,
    pub on_change: Option<Rc<Handler>>,
    pub on_click: Option<Rc<Handler>>,
}

impl fmt::Debug for Props {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Props")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("value", &self.value)
            .field("checked", &self.checked)
            .field("default_value", &self.default_value)
            .field("default_checked", &self.default_checked)
            .field("min", &self.min)
            .field("max", &self.max)
            .field("step", &self.step)
            .field("read_only", &self.read_only)
            .field("disabled", &self.disabled)
            .field("on_change", &self.on_change.is_some())
            .field("on_click", &self.on_click.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum VirtualNode {
    Element {
        tag: String,
        props: Props,
        children: Vec<VirtualNode>,
    },
    Text(String),
}

pub fn el(tag: &str, props: Props, children: Vec<VirtualNode>) -> VirtualNode {
    VirtualNode::Element {
        tag: tag.to_string(),
        props,
        children,
    }
}

pub fn text(content: &str) -> VirtualNode {
    VirtualNode::Text(content.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Text,
    Checkbox,
    Radio,
    Other,
}

impl ControlKind {
    pub fn of(tag: &str, props: &Props) -> Self {
        if tag.eq_ignore_ascii_case("textarea") {
            return Self::Text;
        }
        if !tag.eq_ignore_ascii_case("input") {
            return Self::Other;
        }
        match props.kind.as_deref() {
            Some("checkbox") => Self::Checkbox,
            Some("radio") => Self::Radio,
            _ => Self::Text,
        }
    }

    fn uses_checked(self) -> bool {
        matches!(self, Self::Checkbox | Self::Radio)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlledState {
    Controlled,
    Uncontrolled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    ToControlled,
    ToUncontrolled,
    Illegal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub state: ControlledState,
    pub transition: Transition,
}

fn controlling_prop(props: &Props, kind: ControlKind) -> Option<&PropValue> {
    if kind.uses_checked() {
        props.checked.as_ref()
    } else {
        props.value.as_ref()
    }
}

// A null controlling prop is flagged separately but classifies as
// uncontrolled, so a controlled -> null render reports the transition.
fn is_controlled(props: &Props, kind: ControlKind) -> bool {
    controlling_prop(props, kind).is_some_and(|value| !value.is_null())
}

pub fn classify(prev: Option<&Props>, next: &Props, tag: &str) -> Classification {
    let next_kind = ControlKind::of(tag, next);
    let now_controlled = next_kind != ControlKind::Other && is_controlled(next, next_kind);
    let state = if now_controlled {
        ControlledState::Controlled
    } else {
        ControlledState::Uncontrolled
    };

    let Some(prev) = prev else {
        return Classification {
            state,
            transition: Transition::None,
        };
    };

    let prev_kind = ControlKind::of(tag, prev);
    if prev_kind != ControlKind::Other
        && next_kind != ControlKind::Other
        && prev_kind.uses_checked() != next_kind.uses_checked()
        && (is_controlled(prev, prev_kind) || now_controlled)
    {
        return Classification {
            state,
            transition: Transition::Illegal,
        };
    }

    let was_controlled = prev_kind != ControlKind::Other && is_controlled(prev, prev_kind);
    let transition = match (was_controlled, now_controlled) {
        (false, true) => Transition::ToControlled,
        (true, false) => Transition::ToUncontrolled,
        _ => Transition::None,
    };
    Classification { state, transition }
}

#[derive(Debug, Default)]
struct WarningLog {
    lines: Vec<String>,
    seen: HashSet<String>,
}

impl WarningLog {
    fn warn(&mut self, message: String) {
        if self.seen.insert(message.clone()) {
            log::warn!(target: "form_reconciler", "{message}");
            self.lines.push(message);
        }
    }

    fn take(&mut self) -> Vec<String> {
        self.seen.clear();
        std::mem::take(&mut self.lines)
    }
}

#[derive(Debug, Clone)]
struct Tracker {
    last_value: String,
    passthrough: bool,
}

#[derive(Debug, Default)]
struct TrackerStore {
    map: HashMap<NodeId, Tracker>,
}

impl TrackerStore {
    fn attach(&mut self, dom: &Dom, node: NodeId) {
        let tracker = match dom.element(node) {
            Some(element) if is_form_control_tag(&element.tag_name) => {
                let last_value = if element.tag_name == "input"
                    && matches!(element.input_kind(), "checkbox" | "radio")
                {
                    bool_str(element.checked).to_string()
                } else {
                    element.value.clone()
                };
                Tracker {
                    last_value,
                    passthrough: false,
                }
            }
            // The value property cannot be intercepted here; degrade to
            // direct reads instead of failing.
            _ => Tracker {
                last_value: String::new(),
                passthrough: true,
            },
        };
        self.map.insert(node, tracker);
    }

    fn detach(&mut self, node: NodeId) {
        self.map.remove(&node);
    }

    fn is_tracked(&self, node: NodeId) -> bool {
        self.map
            .get(&node)
            .is_some_and(|tracker| !tracker.passthrough)
    }

    fn note(&mut self, node: NodeId, value: &str) {
        if let Some(tracker) = self.map.get_mut(&node) {
            if !tracker.passthrough {
                tracker.last_value = value.to_string();
            }
        }
    }

    fn get_value(&self, dom: &Dom, node: NodeId) -> String {
        match self.map.get(&node) {
            Some(tracker) if !tracker.passthrough => tracker.last_value.clone(),
            _ => {
                let checkable = dom.is_checkbox(node) || dom.is_radio(node);
                if checkable {
                    bool_str(dom.checked_of(node)).to_string()
                } else {
                    dom.value_of(node)
                }
            }
        }
    }

    fn tracked_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .map
            .iter()
            .filter(|(_, tracker)| !tracker.passthrough)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

#[derive(Default)]
struct ListenerStore {
    map: HashMap<NodeId, HashMap<String, Vec<Rc<Handler>>>>,
}

impl fmt::Debug for ListenerStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count: usize = self.map.values().map(|events| events.len()).sum();
        f.debug_struct("ListenerStore")
            .field("nodes", &self.map.len())
            .field("event_kinds", &count)
            .finish()
    }
}

impl ListenerStore {
    fn set(&mut self, node: NodeId, event: &str, handlers: Vec<Rc<Handler>>) {
        let events = self.map.entry(node).or_default();
        if handlers.is_empty() {
            events.remove(event);
        } else {
            events.insert(event.to_string(), handlers);
        }
    }

    fn remove_node(&mut self, node: NodeId) {
        self.map.remove(&node);
    }

    fn get(&self, node: NodeId, event: &str) -> Vec<Rc<Handler>> {
        self.map
            .get(&node)
            .and_then(|events| events.get(event))
            .map(|handlers| handlers.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorePhase {
    Idle,
    Dispatching,
    Settling,
}

pub struct Runtime {
    dom: Dom,
    trackers: TrackerStore,
    listeners: ListenerStore,
    committed: HashMap<NodeId, Props>,
    warnings: WarningLog,
    writes: Vec<NativeWrite>,
    write_limit: usize,
    phase: RestorePhase,
    dispatch_depth: usize,
    focused: Option<NodeId>,
    focus_baseline: Option<String>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("nodes", &self.dom.nodes.len())
            .field("tracked", &self.trackers.map.len())
            .field("phase", &self.phase)
            .field("dispatch_depth", &self.dispatch_depth)
            .finish()
    }
}

const RENDER_STACK_RED_ZONE: usize = 64 * 1024;
const RENDER_STACK_SIZE: usize = 8 * 1024 * 1024;

impl Runtime {
    pub fn new() -> Self {
        Self {
            dom: Dom::new(),
            trackers: TrackerStore::default(),
            listeners: ListenerStore::default(),
            committed: HashMap::new(),
            warnings: WarningLog::default(),
            writes: Vec::new(),
            write_limit: 10_000,
            phase: RestorePhase::Idle,
            dispatch_depth: 0,
            focused: None,
            focus_baseline: None,
        }
    }

    pub fn restore_phase(&self) -> RestorePhase {
        self.phase
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings.lines
    }

    pub fn take_warnings(&mut self) -> Vec<String> {
        self.warnings.take()
    }

    pub fn native_writes(&self) -> &[NativeWrite] {
        &self.writes
    }

    pub fn take_native_writes(&mut self) -> Vec<NativeWrite> {
        std::mem::take(&mut self.writes)
    }

    pub fn set_native_write_limit(&mut self, max_entries: usize) -> Result<()> {
        if max_entries == 0 {
            return Err(Error::HostState(
                "set_native_write_limit requires at least 1 entry".into(),
            ));
        }
        self.write_limit = max_entries;
        while self.writes.len() > self.write_limit {
            self.writes.remove(0);
        }
        Ok(())
    }

    fn log_write(&mut self, node: NodeId, kind: WriteKind, name: &str, value: &str) {
        self.writes.push(NativeWrite {
            node,
            kind,
            name: name.to_string(),
            value: value.to_string(),
        });
        while self.writes.len() > self.write_limit {
            self.writes.remove(0);
        }
    }

    // Native property writes. Every write lands in the write log and is
    // observed by the value tracker in the same step, so the tracked value
    // can never lag the live property across a turn boundary.

    fn write_value_native(&mut self, node: NodeId, value: &str, mark_dirty: bool) {
        self.dom.set_value_raw(node, value, mark_dirty);
        self.log_write(node, WriteKind::Prop, "value", value);
        // Checkable inputs track checked-ness; their submit value is not the
        // tracked property.
        if !self.dom.is_checkbox(node) && !self.dom.is_radio(node) {
            self.trackers.note(node, value);
        }
    }

    fn write_checked_native(&mut self, node: NodeId, checked: bool) {
        if checked && self.dom.is_radio(node) {
            for peer in self.dom.radio_group_peers(node) {
                if self.dom.checked_of(peer) {
                    self.dom.set_checked_raw(peer, false, true);
                    self.log_write(peer, WriteKind::Prop, "checked", "false");
                    self.trackers.note(peer, "false");
                }
            }
        }
        self.dom.set_checked_raw(node, checked, true);
        self.log_write(node, WriteKind::Prop, "checked", bool_str(checked));
        self.trackers.note(node, bool_str(checked));
    }

    fn set_attr_native(&mut self, node: NodeId, name: &str, value: &str) {
        if let Some(element) = self.dom.element_mut(node) {
            element.attrs.insert(name.to_string(), value.to_string());
            match name {
                "disabled" => element.disabled = true,
                "readonly" => element.readonly = true,
                _ => {}
            }
        }
        self.log_write(node, WriteKind::Attr, name, value);
        if name == "value" {
            // The value attribute is the default; it reflects into the live
            // value only while the control is pristine.
            let pristine = self
                .dom
                .element(node)
                .is_some_and(|element| !element.value_dirty);
            if let Some(element) = self.dom.element_mut(node) {
                element.default_value = value.to_string();
            }
            if pristine {
                let owned = value.to_string();
                self.dom.set_value_raw(node, &owned, false);
                if !self.dom.is_checkbox(node) && !self.dom.is_radio(node) {
                    self.trackers.note(node, &owned);
                }
            }
        }
    }

    fn remove_attr_native(&mut self, node: NodeId, name: &str) {
        if let Some(element) = self.dom.element_mut(node) {
            element.attrs.remove(name);
            match name {
                "disabled" => element.disabled = false,
                "readonly" => element.readonly = false,
                "value" => element.default_value.clear(),
                _ => {}
            }
        }
        self.log_write(node, WriteKind::AttrRemove, name, "");
        if name == "value" {
            let pristine = self
                .dom
                .element(node)
                .is_some_and(|element| !element.value_dirty);
            if pristine {
                self.dom.set_value_raw(node, "", false);
                if !self.dom.is_checkbox(node) && !self.dom.is_radio(node) {
                    self.trackers.note(node, "");
                }
            }
        }
    }

    fn set_default_checked_native(&mut self, node: NodeId, default_checked: bool) {
        if let Some(element) = self.dom.element_mut(node) {
            if default_checked {
                element.attrs.insert("checked".to_string(), String::new());
            } else {
                element.attrs.remove("checked");
            }
            element.default_checked = default_checked;
        }
        let kind = if default_checked {
            WriteKind::Attr
        } else {
            WriteKind::AttrRemove
        };
        self.log_write(node, kind, "checked", bool_str(default_checked));
        let pristine = self
            .dom
            .element(node)
            .is_some_and(|element| !element.checked_dirty);
        if pristine && self.dom.checked_of(node) != default_checked {
            if default_checked && self.dom.is_radio(node) {
                for peer in self.dom.radio_group_peers(node) {
                    if self.dom.checked_of(peer) {
                        self.dom.set_checked_raw(peer, false, false);
                        self.trackers.note(peer, "false");
                    }
                }
            }
            self.dom.set_checked_raw(node, default_checked, false);
            self.trackers.note(node, bool_str(default_checked));
        }
    }
}

fn controlled_value(props: &Props) -> Option<String> {
    match props.value.as_ref() {
        Some(value) if !value.is_null() => Some(value.to_string()),
        _ => None,
    }
}

fn controlled_checked(props: &Props) -> Option<bool> {
    match props.checked.as_ref() {
        Some(PropValue::Bool(checked)) => Some(*checked),
        Some(PropValue::Null) | None => None,
        Some(PropValue::Str(s)) => Some(!s.is_empty()),
        Some(PropValue::Num(n)) => Some(*n != 0.0),
    }
}

fn element_label(tag: &str, props: &Props) -> String {
    if tag.eq_ignore_ascii_case("input") {
        format!(
            "input of type \"{}\"",
            props.kind.as_deref().unwrap_or("text")
        )
    } else {
        tag.to_ascii_lowercase()
    }
}

impl Runtime {
    fn emit_prop_warnings(&mut self, prev: Option<&Props>, next: &Props, tag: &str) {
        let kind = ControlKind::of(tag, next);
        if kind == ControlKind::Other {
            return;
        }
        let label = element_label(tag, next);
        let classification = classify(prev, next, tag);
        match classification.transition {
            Transition::ToUncontrolled => self.warnings.warn(format!(
                "{label} is changing from controlled to uncontrolled; \
                 elements should stay one or the other for their whole lifetime"
            )),
            Transition::ToControlled => self.warnings.warn(format!(
                "{label} is changing from uncontrolled to controlled; \
                 elements should stay one or the other for their whole lifetime"
            )),
            Transition::Illegal => self.warnings.warn(format!(
                "{label} switched its controlling prop between `value` and `checked` \
                 across renders; keep one controlling prop per element"
            )),
            Transition::None => {}
        }

        if kind.uses_checked() {
            if next.checked.as_ref().is_some_and(PropValue::is_null) {
                self.warnings.warn(format!(
                    "null is not a valid `checked` for a controlled {label}; \
                     pass false or omit the prop"
                ));
            }
            if controlled_checked(next).is_some() && next.default_checked.is_some() {
                self.warnings.warn(format!(
                    "{label} declares both `checked` and `default_checked`; \
                     the default is ignored while the element stays controlled"
                ));
            }
            if controlled_checked(next).is_some()
                && next.on_change.is_none()
                && !next.read_only
                && !next.disabled
            {
                self.warnings.warn(format!(
                    "controlled {label} has a `checked` prop without an `on_change` handler \
                     and is not read-only; the control will reject toggling"
                ));
            }
        } else {
            if next.value.as_ref().is_some_and(PropValue::is_null) {
                self.warnings.warn(format!(
                    "null is not a valid `value` for a controlled {label}; \
                     pass an empty string or omit the prop"
                ));
            }
            if controlled_value(next).is_some() && next.default_value.is_some() {
                self.warnings.warn(format!(
                    "{label} declares both `value` and `default_value`; \
                     the default is ignored while the element stays controlled"
                ));
            }
            if controlled_value(next).is_some()
                && next.on_change.is_none()
                && !next.read_only
                && !next.disabled
            {
                self.warnings.warn(format!(
                    "controlled {label} has a `value` prop without an `on_change` handler \
                     and is not read-only; the field will reject user edits"
                ));
            }
        }
    }

    fn register_listeners(&mut self, node: NodeId, props: &Props) {
        let change_handlers: Vec<Rc<Handler>> = props
            .on_change
            .iter()
            .map(|handler| Rc::clone(handler))
            .collect();
        self.listeners.set(node, "input", change_handlers.clone());
        self.listeners.set(node, "change", change_handlers);
        let click_handlers: Vec<Rc<Handler>> = props
            .on_click
            .iter()
            .map(|handler| Rc::clone(handler))
            .collect();
        self.listeners.set(node, "click", click_handlers);
    }

    pub fn mount(&mut self, node: NodeId, props: &Props) -> Result<()> {
        let tag = self
            .dom
            .tag_name(node)
            .ok_or_else(|| Error::HostState("mount target is not an element".into()))?
            .to_string();
        self.emit_prop_warnings(None, props, &tag);

        // Write order matters: type first, then step/min/max, then
        // value/checked, defaults after, and name last so a radio does not
        // join its group before its checked state lands.
        if let Some(kind) = &props.kind {
            self.set_attr_native(node, "type", &kind.clone());
        }
        if let Some(step) = &props.step {
            self.set_attr_native(node, "step", &step.to_string());
        }
        if let Some(min) = &props.min {
            self.set_attr_native(node, "min", &min.to_string());
        }
        if let Some(max) = &props.max {
            self.set_attr_native(node, "max", &max.to_string());
        }

        self.trackers.attach(&self.dom, node);

        let kind = ControlKind::of(&tag, props);
        if kind.uses_checked() {
            if let Some(checked) = controlled_checked(props) {
                self.write_checked_native(node, checked);
            }
        } else if kind == ControlKind::Text {
            if let Some(value) = controlled_value(props) {
                self.write_value_native(node, &value, true);
            }
        }

        if let Some(default_value) = &props.default_value {
            self.set_attr_native(node, "value", &default_value.to_string());
        }
        if let Some(default_checked) = props.default_checked {
            if default_checked {
                self.set_default_checked_native(node, true);
            }
        }
        if props.disabled {
            self.set_attr_native(node, "disabled", "");
        }
        if props.read_only {
            self.set_attr_native(node, "readonly", "");
        }
        if let Some(name) = &props.name {
            self.set_attr_native(node, "name", &name.clone());
        }

        self.register_listeners(node, props);
        self.committed.insert(node, props.clone());
        Ok(())
    }

    pub fn update(&mut self, node: NodeId, prev: &Props, next: &Props) -> Result<()> {
        let tag = self
            .dom
            .tag_name(node)
            .ok_or_else(|| Error::HostState("update target is not an element".into()))?
            .to_string();
        self.emit_prop_warnings(Some(prev), next, &tag);

        if next.id != prev.id {
            self.dom.set_id(node, next.id.as_deref());
        }

        match (&prev.kind, &next.kind) {
            (_, Some(kind)) if prev.kind.as_deref() != Some(kind.as_str()) => {
                self.set_attr_native(node, "type", &kind.clone());
            }
            (Some(_), None) => self.remove_attr_native(node, "type"),
            _ => {}
        }
        self.update_scalar_attr(node, "step", prev.step.as_ref(), next.step.as_ref());
        self.update_scalar_attr(node, "min", prev.min.as_ref(), next.min.as_ref());
        self.update_scalar_attr(node, "max", prev.max.as_ref(), next.max.as_ref());

        let kind = ControlKind::of(&tag, next);
        if kind.uses_checked() {
            if let Some(checked) = controlled_checked(next) {
                let wanted = bool_str(checked);
                if self.trackers.get_value(&self.dom, node) != wanted
                    || self.dom.checked_of(node) != checked
                {
                    self.write_checked_native(node, checked);
                }
            }
        } else if kind == ControlKind::Text {
            if let Some(value) = controlled_value(next) {
                if self.trackers.get_value(&self.dom, node) != value
                    || self.dom.value_of(node) != value
                {
                    self.write_value_native(node, &value, true);
                }
            }
        }

        match &next.default_value {
            Some(default_value) => {
                let wanted = default_value.to_string();
                if self.dom.default_value_of(node) != wanted {
                    self.set_attr_native(node, "value", &wanted);
                    let is_date = self
                        .dom
                        .element(node)
                        .is_some_and(|element| is_date_kind(element.input_kind()));
                    if is_date && controlled_value(next).is_none() {
                        // Date inputs do not repaint a default change unless
                        // the live value is flushed through empty.
                        self.write_value_native(node, "", false);
                        self.write_value_native(node, &wanted, false);
                    }
                }
            }
            None => {
                if prev.default_value.is_some() {
                    self.remove_attr_native(node, "value");
                }
            }
        }
        match next.default_checked {
            Some(default_checked) => {
                if self
                    .dom
                    .element(node)
                    .is_some_and(|element| element.default_checked != default_checked)
                {
                    self.set_default_checked_native(node, default_checked);
                }
            }
            None => {
                if prev.default_checked.is_some() {
                    self.set_default_checked_native(node, false);
                }
            }
        }

        if next.disabled != prev.disabled {
            if next.disabled {
                self.set_attr_native(node, "disabled", "");
            } else {
                self.remove_attr_native(node, "disabled");
            }
        }
        if next.read_only != prev.read_only {
            if next.read_only {
                self.set_attr_native(node, "readonly", "");
            } else {
                self.remove_attr_native(node, "readonly");
            }
        }
        match (&prev.name, &next.name) {
            (_, Some(name)) if prev.name.as_deref() != Some(name.as_str()) => {
                self.set_attr_native(node, "name", &name.clone());
            }
            (Some(_), None) => self.remove_attr_native(node, "name"),
            _ => {}
        }

        self.register_listeners(node, next);
        self.committed.insert(node, next.clone());
        Ok(())
    }

    fn update_scalar_attr(
        &mut self,
        node: NodeId,
        name: &str,
        prev: Option<&PropValue>,
        next: Option<&PropValue>,
    ) {
        match (prev, next) {
            (_, Some(next_value)) => {
                let wanted = next_value.to_string();
                if self.dom.attr(node, name) != Some(wanted.as_str()) {
                    self.set_attr_native(node, name, &wanted);
                }
            }
            (Some(_), None) => self.remove_attr_native(node, name),
            (None, None) => {}
        }
    }
}

impl Runtime {
    pub fn render(&mut self, tree: &VirtualNode) -> Result<()> {
        let root = self.dom.root;
        self.reconcile_children(root, std::slice::from_ref(tree))
    }

    fn reconcile_children(&mut self, parent: NodeId, next: &[VirtualNode]) -> Result<()> {
        stacker::maybe_grow(RENDER_STACK_RED_ZONE, RENDER_STACK_SIZE, || {
            self.reconcile_children_impl(parent, next)
        })
    }

    fn reconcile_children_impl(&mut self, parent: NodeId, next: &[VirtualNode]) -> Result<()> {
        let existing = self.dom.children(parent).to_vec();
        for (index, vchild) in next.iter().enumerate() {
            match existing.get(index).copied() {
                Some(node) if self.matches(node, vchild) => match vchild {
                    VirtualNode::Element {
                        props, children, ..
                    } => {
                        let prev = self.committed.get(&node).cloned().ok_or_else(|| {
                            Error::HostState("element has no committed props".into())
                        })?;
                        self.update(node, &prev, props)?;
                        self.reconcile_children(node, children)?;
                    }
                    VirtualNode::Text(content) => {
                        if let NodeType::Text(current) = &mut self.dom.nodes[node.0].node_type {
                            if current != content {
                                *current = content.clone();
                            }
                        }
                    }
                },
                Some(node) => {
                    self.unmount_subtree(node);
                    self.dom.detach(node);
                    self.create_from_vnode(parent, index, vchild)?;
                }
                None => {
                    self.create_from_vnode(parent, usize::MAX, vchild)?;
                }
            }
        }
        for node in existing.into_iter().skip(next.len()) {
            self.unmount_subtree(node);
            self.dom.detach(node);
        }
        Ok(())
    }

    fn matches(&self, node: NodeId, vnode: &VirtualNode) -> bool {
        match (&self.dom.nodes[node.0].node_type, vnode) {
            (NodeType::Element(element), VirtualNode::Element { tag, .. }) => {
                element.tag_name.eq_ignore_ascii_case(tag)
            }
            (NodeType::Text(_), VirtualNode::Text(_)) => true,
            _ => false,
        }
    }

    fn create_from_vnode(
        &mut self,
        parent: NodeId,
        index: usize,
        vnode: &VirtualNode,
    ) -> Result<NodeId> {
        match vnode {
            VirtualNode::Element {
                tag,
                props,
                children,
            } => {
                let node = self.dom.create_element(parent, index, tag);
                if let Some(id) = &props.id {
                    self.dom.set_id(node, Some(id));
                }
                self.mount(node, props)?;
                self.reconcile_children(node, children)?;
                Ok(node)
            }
            VirtualNode::Text(content) => Ok(self.dom.create_text(parent, index, content)),
        }
    }

    fn unmount_subtree(&mut self, node: NodeId) {
        for child in self.dom.children(node).to_vec() {
            self.unmount_subtree(child);
        }
        if let Some(id) = self.dom.attr(node, "id").map(str::to_string) {
            if self.dom.id_index.get(&id) == Some(&node) {
                self.dom.id_index.remove(&id);
            }
        }
        self.trackers.detach(node);
        self.listeners.remove_node(node);
        self.committed.remove(&node);
        if self.focused == Some(node) {
            self.focused = None;
            self.focus_baseline = None;
        }
    }
}

impl Runtime {
    pub fn on_native_event(&mut self, event_type: &str, node: NodeId) -> Result<()> {
        self.begin_turn();
        let result = self.dispatch_event(node, event_type);
        self.end_turn();
        result
    }

    fn begin_turn(&mut self) {
        self.dispatch_depth += 1;
        self.phase = RestorePhase::Dispatching;
    }

    fn end_turn(&mut self) {
        self.dispatch_depth -= 1;
        if self.dispatch_depth == 0 {
            // Restoration waits for every reentrant handler of the original
            // event, then always runs to completion.
            self.phase = RestorePhase::Settling;
            self.settle();
            self.phase = RestorePhase::Idle;
        }
    }

    fn dispatch_event(&mut self, target: NodeId, event_type: &str) -> Result<()> {
        let snapshot = EventSnapshot {
            event_type: event_type.to_string(),
            target,
            value: self.dom.value_of(target),
            checked: self.dom.checked_of(target),
        };
        let mut path = Vec::new();
        let mut cursor = Some(target);
        while let Some(node) = cursor {
            path.push(node);
            cursor = self.dom.parent(node);
        }
        // Target first, then bubble toward the document.
        for node in path {
            for handler in self.listeners.get(node, event_type) {
                (*handler)(self, &snapshot)?;
            }
        }
        Ok(())
    }

    fn settle(&mut self) {
        for node in self.trackers.tracked_ids() {
            let Some(props) = self.committed.get(&node) else {
                continue;
            };
            let tag = self.dom.tag_name(node).unwrap_or_default();
            let kind = ControlKind::of(tag, props);
            let want_checked = if kind.uses_checked() {
                controlled_checked(props)
            } else {
                None
            };
            let want_value = if kind == ControlKind::Text {
                controlled_value(props)
            } else {
                None
            };
            // Divergence is re-read per node: restoring one radio flips its
            // peers' trackers before the scan reaches them.
            if let Some(checked) = want_checked {
                if self.trackers.get_value(&self.dom, node) != bool_str(checked) {
                    self.write_checked_native(node, checked);
                }
            }
            if let Some(value) = want_value {
                if self.trackers.get_value(&self.dom, node) != value {
                    self.write_value_native(node, &value, true);
                }
            }
        }
    }
}

impl Runtime {
    pub fn select_one(&self, selector: &str) -> Result<NodeId> {
        if let Some(id) = selector.strip_prefix('#') {
            if id.is_empty() || id.contains(['#', '.', ' ', '[']) {
                return Err(Error::UnsupportedSelector(selector.to_string()));
            }
            return self
                .dom
                .id_index
                .get(id)
                .copied()
                .ok_or_else(|| Error::SelectorNotFound(selector.to_string()));
        }
        if !selector.is_empty()
            && selector
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return self
                .dom
                .all_element_nodes()
                .into_iter()
                .find(|node| {
                    self.dom
                        .tag_name(*node)
                        .is_some_and(|tag| tag.eq_ignore_ascii_case(selector))
                })
                .ok_or_else(|| Error::SelectorNotFound(selector.to_string()));
        }
        Err(Error::UnsupportedSelector(selector.to_string()))
    }

    pub fn value(&self, selector: &str) -> Result<String> {
        let target = self.select_one(selector)?;
        Ok(self.dom.value_of(target))
    }

    pub fn checked(&self, selector: &str) -> Result<bool> {
        let target = self.select_one(selector)?;
        Ok(self.dom.checked_of(target))
    }

    pub fn tracked_value(&self, selector: &str) -> Result<String> {
        let target = self.select_one(selector)?;
        Ok(self.trackers.get_value(&self.dom, target))
    }

    pub fn is_tracked(&self, selector: &str) -> Result<bool> {
        let target = self.select_one(selector)?;
        Ok(self.trackers.is_tracked(target))
    }

    pub fn type_text(&mut self, selector: &str, text: &str) -> Result<()> {
        let target = self.select_one(selector)?;
        if self.dom.disabled(target) || self.dom.readonly(target) {
            return Ok(());
        }
        let tag = self
            .dom
            .tag_name(target)
            .ok_or_else(|| Error::TypeMismatch {
                selector: selector.to_string(),
                expected: "input or textarea".into(),
                actual: "non-element".into(),
            })?
            .to_string();
        if !is_form_control_tag(&tag) {
            return Err(Error::TypeMismatch {
                selector: selector.to_string(),
                expected: "input or textarea".into(),
                actual: tag,
            });
        }
        self.begin_turn();
        let result = self.type_text_inner(target, text);
        self.end_turn();
        result
    }

    fn type_text_inner(&mut self, target: NodeId, text: &str) -> Result<()> {
        self.write_value_native(target, text, true);
        self.dispatch_event(target, "input")
    }

    pub fn set_checked(&mut self, selector: &str, checked: bool) -> Result<()> {
        let target = self.select_one(selector)?;
        if self.dom.disabled(target) {
            return Ok(());
        }
        if !self.dom.is_checkbox(target) && !self.dom.is_radio(target) {
            let actual = self.dom.tag_name(target).unwrap_or("non-element").to_string();
            return Err(Error::TypeMismatch {
                selector: selector.to_string(),
                expected: "input[type=checkbox|radio]".into(),
                actual,
            });
        }
        if self.dom.checked_of(target) == checked {
            return Ok(());
        }
        self.begin_turn();
        let result = self.set_checked_inner(target, checked);
        self.end_turn();
        result
    }

    fn set_checked_inner(&mut self, target: NodeId, checked: bool) -> Result<()> {
        self.write_checked_native(target, checked);
        self.dispatch_event(target, "input")?;
        self.dispatch_event(target, "change")
    }

    pub fn click(&mut self, selector: &str) -> Result<()> {
        let target = self.select_one(selector)?;
        if self.dom.disabled(target) {
            return Ok(());
        }
        self.begin_turn();
        let result = self.click_inner(target);
        self.end_turn();
        result
    }

    fn click_inner(&mut self, target: NodeId) -> Result<()> {
        self.dispatch_event(target, "click")?;
        if self.dom.is_checkbox(target) {
            let next = !self.dom.checked_of(target);
            self.write_checked_native(target, next);
            self.dispatch_event(target, "input")?;
            self.dispatch_event(target, "change")?;
        } else if self.dom.is_radio(target) && !self.dom.checked_of(target) {
            self.write_checked_native(target, true);
            self.dispatch_event(target, "input")?;
            self.dispatch_event(target, "change")?;
        }
        Ok(())
    }

    pub fn set_native_value(&mut self, selector: &str, value: &str) -> Result<()> {
        let target = self.select_one(selector)?;
        if !self.dom.is_form_control(target) {
            let actual = self.dom.tag_name(target).unwrap_or("non-element").to_string();
            return Err(Error::TypeMismatch {
                selector: selector.to_string(),
                expected: "input or textarea".into(),
                actual,
            });
        }
        self.write_value_native(target, value, true);
        Ok(())
    }

    pub fn set_native_checked(&mut self, selector: &str, checked: bool) -> Result<()> {
        let target = self.select_one(selector)?;
        if !self.dom.is_checkbox(target) && !self.dom.is_radio(target) {
            let actual = self.dom.tag_name(target).unwrap_or("non-element").to_string();
            return Err(Error::TypeMismatch {
                selector: selector.to_string(),
                expected: "input[type=checkbox|radio]".into(),
                actual,
            });
        }
        self.write_checked_native(target, checked);
        Ok(())
    }

    pub fn dispatch(&mut self, selector: &str, event_type: &str) -> Result<()> {
        let target = self.select_one(selector)?;
        self.on_native_event(event_type, target)
    }

    pub fn focus(&mut self, selector: &str) -> Result<()> {
        let target = self.select_one(selector)?;
        if self.dom.disabled(target) || self.focused == Some(target) {
            return Ok(());
        }
        self.begin_turn();
        let result = self.focus_inner(target);
        self.end_turn();
        result
    }

    fn focus_inner(&mut self, target: NodeId) -> Result<()> {
        let previous = self.focused.take();
        let baseline = self.focus_baseline.take();
        self.focused = Some(target);
        self.focus_baseline = Some(self.dom.value_of(target));
        if let Some(old) = previous {
            if let Some(base) = baseline {
                if self.dom.is_form_control(old) && self.dom.value_of(old) != base {
                    self.dispatch_event(old, "change")?;
                }
            }
            self.dispatch_event(old, "blur")?;
        }
        self.dispatch_event(target, "focus")
    }

    pub fn blur(&mut self, selector: &str) -> Result<()> {
        let target = self.select_one(selector)?;
        if self.focused != Some(target) {
            return Ok(());
        }
        self.begin_turn();
        let result = self.blur_inner(target);
        self.end_turn();
        result
    }

    fn blur_inner(&mut self, target: NodeId) -> Result<()> {
        let baseline = self.focus_baseline.take();
        self.focused = None;
        if let Some(base) = baseline {
            if self.dom.is_form_control(target) && self.dom.value_of(target) != base {
                self.dispatch_event(target, "change")?;
            }
        }
        self.dispatch_event(target, "blur")
    }

    pub fn assert_exists(&self, selector: &str) -> Result<()> {
        self.select_one(selector).map(|_| ())
    }

    pub fn assert_value(&self, selector: &str, expected: &str) -> Result<()> {
        let target = self.select_one(selector)?;
        let actual = self.dom.value_of(target);
        if actual != expected {
            return Err(Error::AssertionFailed {
                selector: selector.to_string(),
                expected: expected.to_string(),
                actual,
                dom_snippet: self.snippet(target),
            });
        }
        Ok(())
    }

    pub fn assert_checked(&self, selector: &str, expected: bool) -> Result<()> {
        let target = self.select_one(selector)?;
        let actual = self.dom.checked_of(target);
        if actual != expected {
            return Err(Error::AssertionFailed {
                selector: selector.to_string(),
                expected: expected.to_string(),
                actual: actual.to_string(),
                dom_snippet: self.snippet(target),
            });
        }
        Ok(())
    }

    fn snippet(&self, node: NodeId) -> String {
        let Some(element) = self.dom.element(node) else {
            return String::new();
        };
        let mut out = format!("<{}", element.tag_name);
        let mut names: Vec<&String> = element.attrs.keys().collect();
        names.sort();
        for name in names {
            if name == "checked" {
                continue;
            }
            let value = &element.attrs[name];
            if value.is_empty() {
                out.push_str(&format!(" {name}"));
            } else {
                out.push_str(&format!(" {name}=\"{}\"", escape_attr(value)));
            }
        }
        if !element.value.is_empty() {
            out.push_str(&format!(" value=\"{}\"", escape_attr(&element.value)));
        }
        if element.checked {
            out.push_str(" checked");
        }
        out.push('>');
        out
    }
}

fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            _ => out.push(c),
        }
    }
    out
}

fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

fn is_void_tag(tag: &str) -> bool {
    matches!(tag, "input" | "br" | "hr" | "img" | "meta")
}

pub fn render_to_string(tree: &VirtualNode) -> String {
    let mut out = String::new();
    write_markup(tree, &mut out);
    out
}

fn write_markup(node: &VirtualNode, out: &mut String) {
    stacker::maybe_grow(RENDER_STACK_RED_ZONE, RENDER_STACK_SIZE, || {
        write_markup_impl(node, out);
    });
}

fn write_markup_impl(node: &VirtualNode, out: &mut String) {
    let VirtualNode::Element {
        tag,
        props,
        children,
    } = node
    else {
        if let VirtualNode::Text(content) = node {
            out.push_str(&escape_text(content));
        }
        return;
    };

    let tag = tag.to_ascii_lowercase();
    out.push('<');
    out.push_str(&tag);
    if let Some(id) = &props.id {
        out.push_str(&format!(" id=\"{}\"", escape_attr(id)));
    }
    if let Some(kind) = &props.kind {
        out.push_str(&format!(" type=\"{}\"", escape_attr(kind)));
    }
    if let Some(name) = &props.name {
        out.push_str(&format!(" name=\"{}\"", escape_attr(name)));
    }
    if let Some(step) = &props.step {
        out.push_str(&format!(" step=\"{}\"", escape_attr(&step.to_string())));
    }
    if let Some(min) = &props.min {
        out.push_str(&format!(" min=\"{}\"", escape_attr(&min.to_string())));
    }
    if let Some(max) = &props.max {
        out.push_str(&format!(" max=\"{}\"", escape_attr(&max.to_string())));
    }

    // The markup carries either the controlled value or the default, never
    // both, and never a default-prop attribute of its own.
    let kind = ControlKind::of(&tag, props);
    if kind == ControlKind::Text {
        let emitted = controlled_value(props).or_else(|| {
            props
                .default_value
                .as_ref()
                .map(|default_value| default_value.to_string())
        });
        if let Some(value) = emitted {
            out.push_str(&format!(" value=\"{}\"", escape_attr(&value)));
        }
    } else if kind.uses_checked() {
        if let Some(value) = &props.value {
            if !value.is_null() {
                out.push_str(&format!(" value=\"{}\"", escape_attr(&value.to_string())));
            }
        }
        let checked = controlled_checked(props).unwrap_or(props.default_checked.unwrap_or(false));
        if checked {
            out.push_str(" checked");
        }
    }

    if props.disabled {
        out.push_str(" disabled");
    }
    if props.read_only {
        out.push_str(" readonly");
    }
    out.push('>');

    if is_void_tag(&tag) {
        return;
    }
    for child in children {
        write_markup(child, out);
    }
    out.push_str(&format!("</{tag}>"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn controlled_text(id: &str, value: &str, on_change: Option<Rc<Handler>>) -> VirtualNode {
        el(
            "input",
            Props {
                id: Some(id.to_string()),
                kind: Some("text".to_string()),
                value: Some(value.into()),
                on_change,
                ..Props::default()
            },
            Vec::new(),
        )
    }

    fn noop_handler() -> Rc<Handler> {
        Rc::new(|_, _| Ok(()))
    }

    #[test]
    fn prop_value_coercion_follows_display() {
        assert_eq!(PropValue::from("lion").to_string(), "lion");
        assert_eq!(PropValue::from(1.0).to_string(), "1");
        assert_eq!(PropValue::from(0.5).to_string(), "0.5");
        assert_eq!(PropValue::from(7).to_string(), "7");
        assert_eq!(PropValue::from(true).to_string(), "true");
        assert_eq!(PropValue::Null.to_string(), "");
    }

    #[test]
    fn classify_reports_both_transition_directions() {
        let controlled = Props {
            value: Some("a".into()),
            ..Props::default()
        };
        let uncontrolled = Props::default();

        let c = classify(Some(&controlled), &uncontrolled, "input");
        assert_eq!(c.state, ControlledState::Uncontrolled);
        assert_eq!(c.transition, Transition::ToUncontrolled);

        let c = classify(Some(&uncontrolled), &controlled, "input");
        assert_eq!(c.state, ControlledState::Controlled);
        assert_eq!(c.transition, Transition::ToControlled);
    }

    #[test]
    fn classify_treats_null_value_as_uncontrolled_for_transitions() {
        let controlled = Props {
            value: Some("a".into()),
            ..Props::default()
        };
        let null_value = Props {
            value: Some(PropValue::Null),
            ..Props::default()
        };
        let c = classify(Some(&controlled), &null_value, "input");
        assert_eq!(c.transition, Transition::ToUncontrolled);
        assert_eq!(c.state, ControlledState::Uncontrolled);
    }

    #[test]
    fn classify_radio_value_changes_are_legal() {
        let before = Props {
            kind: Some("radio".to_string()),
            value: Some("a".into()),
            ..Props::default()
        };
        let after = Props {
            kind: Some("radio".to_string()),
            value: Some("b".into()),
            ..Props::default()
        };
        let c = classify(Some(&before), &after, "input");
        assert_eq!(c.transition, Transition::None);
        assert_eq!(c.state, ControlledState::Uncontrolled);
    }

    #[test]
    fn classify_flags_controlling_prop_family_switch() {
        let text = Props {
            kind: Some("text".to_string()),
            value: Some("a".into()),
            ..Props::default()
        };
        let checkbox = Props {
            kind: Some("checkbox".to_string()),
            checked: Some(true.into()),
            ..Props::default()
        };
        let c = classify(Some(&text), &checkbox, "input");
        assert_eq!(c.transition, Transition::Illegal);
    }

    #[test]
    fn warnings_are_deduplicated_per_distinct_message() -> Result<()> {
        let mut rt = Runtime::new();
        let tree = controlled_text("a", "x", None);
        rt.render(&tree)?;
        rt.render(&tree)?;
        let warnings = rt.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(
            warnings[0].contains("without an `on_change` handler"),
            "unexpected warning: {}",
            warnings[0]
        );

        // Taking resets the seen-set, so the next offending render warns again.
        rt.render(&tree)?;
        assert_eq!(rt.warnings().len(), 1);
        Ok(())
    }

    #[test]
    fn value_and_default_value_together_warn_once() -> Result<()> {
        let mut rt = Runtime::new();
        rt.render(&el(
            "input",
            Props {
                id: Some("a".to_string()),
                value: Some("x".into()),
                default_value: Some("y".into()),
                on_change: Some(noop_handler()),
                ..Props::default()
            },
            Vec::new(),
        ))?;
        let warnings = rt.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("both `value` and `default_value`"));
        Ok(())
    }

    #[test]
    fn null_value_surfaces_its_own_warning() -> Result<()> {
        let mut rt = Runtime::new();
        rt.render(&el(
            "input",
            Props {
                id: Some("a".to_string()),
                value: Some(PropValue::Null),
                ..Props::default()
            },
            Vec::new(),
        ))?;
        let warnings = rt.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("null is not a valid `value`"));
        Ok(())
    }

    #[test]
    fn tracker_degrades_to_passthrough_on_untrackable_nodes() -> Result<()> {
        let mut rt = Runtime::new();
        rt.render(&el(
            "div",
            Props {
                id: Some("box".to_string()),
                ..Props::default()
            },
            Vec::new(),
        ))?;
        assert!(!rt.is_tracked("#box")?);
        assert_eq!(rt.tracked_value("#box")?, "");
        Ok(())
    }

    #[test]
    fn tracked_value_survives_native_writes() -> Result<()> {
        let mut rt = Runtime::new();
        rt.render(&controlled_text("a", "lion", Some(noop_handler())))?;
        assert_eq!(rt.tracked_value("#a")?, "lion");
        rt.set_native_value("#a", "giraffe")?;
        assert_eq!(rt.tracked_value("#a")?, "giraffe");
        assert_eq!(rt.value("#a")?, "giraffe");
        Ok(())
    }

    #[test]
    fn uncontrolled_default_value_reflects_while_pristine() -> Result<()> {
        let mut rt = Runtime::new();
        rt.render(&el(
            "input",
            Props {
                id: Some("a".to_string()),
                default_value: Some("start".into()),
                ..Props::default()
            },
            Vec::new(),
        ))?;
        assert_eq!(rt.value("#a")?, "start");

        // Once the control is dirty the default no longer reflects.
        rt.set_native_value("#a", "typed")?;
        rt.render(&el(
            "input",
            Props {
                id: Some("a".to_string()),
                default_value: Some("later".into()),
                ..Props::default()
            },
            Vec::new(),
        ))?;
        assert_eq!(rt.value("#a")?, "typed");
        Ok(())
    }

    #[test]
    fn name_attribute_is_never_defaulted() -> Result<()> {
        let mut rt = Runtime::new();
        rt.render(&el(
            "input",
            Props {
                id: Some("a".to_string()),
                name: Some("pet".to_string()),
                ..Props::default()
            },
            Vec::new(),
        ))?;
        let target = rt.select_one("#a")?;
        assert_eq!(rt.dom.attr(target, "name"), Some("pet"));

        rt.render(&el(
            "input",
            Props {
                id: Some("a".to_string()),
                ..Props::default()
            },
            Vec::new(),
        ))?;
        assert_eq!(rt.dom.attr(target, "name"), None);
        Ok(())
    }

    #[test]
    fn native_write_limit_rejects_zero() {
        let mut rt = Runtime::new();
        match rt.set_native_write_limit(0) {
            Err(Error::HostState(message)) => {
                assert!(message.contains("at least 1"));
            }
            other => panic!("expected host state error, got: {other:?}"),
        }
        assert!(rt.set_native_write_limit(4).is_ok());
    }

    #[test]
    fn change_handler_sees_the_typed_value() -> Result<()> {
        let seen = Rc::new(RefCell::new(String::new()));
        let seen_in_handler = Rc::clone(&seen);
        let handler: Rc<Handler> = Rc::new(move |_, event| {
            *seen_in_handler.borrow_mut() = event.value.clone();
            Ok(())
        });
        let mut rt = Runtime::new();
        rt.render(&el(
            "input",
            Props {
                id: Some("a".to_string()),
                default_value: Some("".into()),
                on_change: Some(handler),
                ..Props::default()
            },
            Vec::new(),
        ))?;
        rt.type_text("#a", "hello")?;
        assert_eq!(*seen.borrow(), "hello");
        assert_eq!(rt.value("#a")?, "hello");
        Ok(())
    }

    #[test]
    fn disabled_and_readonly_block_typing() -> Result<()> {
        let mut rt = Runtime::new();
        rt.render(&el(
            "div",
            Props::default(),
            vec![
                el(
                    "input",
                    Props {
                        id: Some("off".to_string()),
                        disabled: true,
                        default_value: Some("keep".into()),
                        ..Props::default()
                    },
                    Vec::new(),
                ),
                el(
                    "input",
                    Props {
                        id: Some("ro".to_string()),
                        read_only: true,
                        default_value: Some("keep".into()),
                        ..Props::default()
                    },
                    Vec::new(),
                ),
            ],
        ))?;
        rt.type_text("#off", "nope")?;
        rt.type_text("#ro", "nope")?;
        rt.assert_value("#off", "keep")?;
        rt.assert_value("#ro", "keep")?;
        Ok(())
    }

    #[test]
    fn type_text_rejects_non_form_targets() -> Result<()> {
        let mut rt = Runtime::new();
        rt.render(&el(
            "div",
            Props {
                id: Some("box".to_string()),
                ..Props::default()
            },
            Vec::new(),
        ))?;
        match rt.type_text("#box", "x") {
            Err(Error::TypeMismatch { actual, .. }) => assert_eq!(actual, "div"),
            other => panic!("expected type mismatch, got: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn markup_emits_value_attribute_but_never_defaults() {
        let markup = render_to_string(&el(
            "input",
            Props {
                id: Some("a".to_string()),
                kind: Some("text".to_string()),
                value: Some("1".into()),
                ..Props::default()
            },
            Vec::new(),
        ));
        assert_eq!(markup, "<input id=\"a\" type=\"text\" value=\"1\">");

        let markup = render_to_string(&el(
            "input",
            Props {
                id: Some("b".to_string()),
                default_value: Some("fallback".into()),
                ..Props::default()
            },
            Vec::new(),
        ));
        assert_eq!(markup, "<input id=\"b\" value=\"fallback\">");
        assert!(!markup.contains("default"));
    }

    #[test]
    fn markup_prefers_controlled_value_over_default() {
        let markup = render_to_string(&el(
            "input",
            Props {
                value: Some("live".into()),
                default_value: Some("fallback".into()),
                ..Props::default()
            },
            Vec::new(),
        ));
        assert_eq!(markup, "<input value=\"live\">");
    }

    #[test]
    fn markup_renders_checkbox_checked_as_bare_attribute() {
        let markup = render_to_string(&el(
            "input",
            Props {
                kind: Some("checkbox".to_string()),
                checked: Some(true.into()),
                ..Props::default()
            },
            Vec::new(),
        ));
        assert_eq!(markup, "<input type=\"checkbox\" checked>");

        let markup = render_to_string(&el(
            "input",
            Props {
                kind: Some("checkbox".to_string()),
                default_checked: Some(true),
                ..Props::default()
            },
            Vec::new(),
        ));
        assert_eq!(markup, "<input type=\"checkbox\" checked>");
    }

    #[test]
    fn markup_escapes_attribute_values_and_text() {
        let markup = render_to_string(&el(
            "div",
            Props::default(),
            vec![
                el(
                    "input",
                    Props {
                        value: Some("a\"<b>&c".into()),
                        ..Props::default()
                    },
                    Vec::new(),
                ),
                text("1 < 2 & 3 > 2"),
            ],
        ));
        assert_eq!(
            markup,
            "<div><input value=\"a&quot;&lt;b>&amp;c\">1 &lt; 2 &amp; 3 &gt; 2</div>"
        );
    }

    #[test]
    fn unmounting_detaches_tracking_and_ids() -> Result<()> {
        let mut rt = Runtime::new();
        rt.render(&el(
            "div",
            Props::default(),
            vec![controlled_text("a", "x", Some(noop_handler()))],
        ))?;
        assert!(rt.is_tracked("#a")?);
        rt.render(&el("div", Props::default(), Vec::new()))?;
        match rt.select_one("#a") {
            Err(Error::SelectorNotFound(_)) => {}
            other => panic!("expected missing selector, got: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn blur_fires_change_only_when_value_moved() -> Result<()> {
        let fired = Rc::new(RefCell::new(Vec::new()));
        let fired_in_handler = Rc::clone(&fired);
        let handler: Rc<Handler> = Rc::new(move |_, event| {
            fired_in_handler.borrow_mut().push(event.event_type.clone());
            Ok(())
        });
        let mut rt = Runtime::new();
        rt.render(&el(
            "input",
            Props {
                id: Some("a".to_string()),
                default_value: Some("same".into()),
                on_change: Some(handler),
                ..Props::default()
            },
            Vec::new(),
        ))?;
        rt.focus("#a")?;
        rt.blur("#a")?;
        assert!(fired.borrow().is_empty());

        rt.focus("#a")?;
        rt.set_native_value("#a", "moved")?;
        rt.blur("#a")?;
        assert_eq!(*fired.borrow(), vec!["change"]);
        Ok(())
    }
}
