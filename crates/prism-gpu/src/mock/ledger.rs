//! Create/destroy bookkeeping for the mock backend.

use std::collections::HashMap;
use std::fmt;

/// Kind of object tracked by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    Instance,
    Device,
    Buffer,
    Image,
    Memory,
    ImageView,
    Sampler,
    DescriptorSetLayout,
    DescriptorPool,
    ShaderModule,
    PipelineLayout,
    Pipeline,
    RenderPass,
    Framebuffer,
    CommandPool,
    CommandBuffer,
    Fence,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEvent {
    /// Object was created
    Created(ObjectKind, u64),
    /// Object was destroyed
    Destroyed(ObjectKind, u64),
}

#[derive(Debug, Clone, Copy)]
struct LiveObject {
    kind: ObjectKind,
    owner: u64,
    order: usize,
}

/// Mutable ledger kept behind the mock's lock.
#[derive(Debug, Default)]
pub(crate) struct Ledger {
    events: Vec<LedgerEvent>,
    live: HashMap<u64, LiveObject>,
    destroyed: HashMap<u64, ObjectKind>,
    violations: Vec<String>,
}

impl Ledger {
    pub(crate) fn create(&mut self, kind: ObjectKind, raw: u64, owner: u64) {
        let order = self.events.len();
        self.events.push(LedgerEvent::Created(kind, raw));
        self.live.insert(raw, LiveObject { kind, owner, order });
    }

    /// Record a destruction; returns false (and records a violation) if the
    /// handle is not a live object of `kind`.
    pub(crate) fn destroy(&mut self, kind: ObjectKind, raw: u64) -> bool {
        match self.live.get(&raw) {
            Some(object) if object.kind == kind => {
                self.live.remove(&raw);
                self.destroyed.insert(raw, kind);
                self.events.push(LedgerEvent::Destroyed(kind, raw));
                true
            }
            Some(object) => {
                let actual = object.kind;
                self.violate(format!("destroy of {kind} {raw:#x} which is a {actual}"));
                false
            }
            None if self.destroyed.contains_key(&raw) => {
                self.violate(format!("double destroy of {kind} {raw:#x}"));
                false
            }
            None => {
                self.violate(format!("destroy of unknown {kind} {raw:#x}"));
                false
            }
        }
    }

    pub(crate) fn is_live(&self, raw: u64) -> bool {
        self.live.contains_key(&raw)
    }

    pub(crate) fn live_children(&self, owner: u64) -> Vec<(ObjectKind, u64)> {
        let mut children: Vec<(usize, ObjectKind, u64)> = self
            .live
            .iter()
            .filter(|(_, object)| object.owner == owner)
            .map(|(&raw, object)| (object.order, object.kind, raw))
            .collect();
        children.sort_unstable();
        children.into_iter().map(|(_, kind, raw)| (kind, raw)).collect()
    }

    pub(crate) fn live_of_kind(&self, kind: ObjectKind) -> usize {
        self.live.values().filter(|object| object.kind == kind).count()
    }

    pub(crate) fn violate(&mut self, message: String) {
        tracing::warn!("mock GPU violation: {}", message);
        self.violations.push(message);
    }

    pub(crate) fn snapshot(&self) -> LedgerSnapshot {
        let mut live: Vec<(usize, ObjectKind, u64)> = self
            .live
            .iter()
            .map(|(&raw, object)| (object.order, object.kind, raw))
            .collect();
        live.sort_unstable();
        LedgerSnapshot {
            events: self.events.clone(),
            live: live.into_iter().map(|(_, kind, raw)| (kind, raw)).collect(),
            violations: self.violations.clone(),
        }
    }
}

/// Point-in-time copy of the mock ledger.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    events: Vec<LedgerEvent>,
    live: Vec<(ObjectKind, u64)>,
    violations: Vec<String>,
}

impl LedgerSnapshot {
    /// Every create and destroy in call order.
    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    /// Protocol violations seen so far.
    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    /// Objects created and not yet destroyed, oldest first.
    pub fn live_objects(&self) -> &[(ObjectKind, u64)] {
        &self.live
    }

    /// Kinds of destroyed objects in destruction order.
    pub fn destroy_order(&self) -> Vec<ObjectKind> {
        self.events
            .iter()
            .filter_map(|event| match event {
                LedgerEvent::Destroyed(kind, _) => Some(*kind),
                LedgerEvent::Created(..) => None,
            })
            .collect()
    }

    /// Number of objects of `kind` ever created.
    pub fn created_count(&self, kind: ObjectKind) -> usize {
        self.events
            .iter()
            .filter(|event| matches!(event, LedgerEvent::Created(k, _) if *k == kind))
            .count()
    }

    /// Number of live objects of `kind`.
    pub fn live_count(&self, kind: ObjectKind) -> usize {
        self.live.iter().filter(|(k, _)| *k == kind).count()
    }
}
