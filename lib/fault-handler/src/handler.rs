//! The fault handler contract and the ordered buckets handlers live in.

use crate::context::{FaultInfo, SignalContext};
use crate::manager::FaultManager;
use std::fmt;

/// A recognizer for one expected shape of fault.
pub trait FaultHandler: Send + Sync {
    /// Looks at a fault and, if it has the expected shape, performs the
    /// corrective runtime action and returns `true`.
    ///
    /// Runs inside the fault signal handler.
    fn action(
        &self,
        manager: &FaultManager,
        signal: libc::c_int,
        info: &FaultInfo,
        context: &mut SignalContext,
    ) -> bool;

    /// A name for diagnostics.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl<F> FaultHandler for F
where
    F: Fn(&FaultManager, libc::c_int, &FaultInfo, &mut SignalContext) -> bool + Send + Sync,
{
    fn action(
        &self,
        manager: &FaultManager,
        signal: libc::c_int,
        info: &FaultInfo,
        context: &mut SignalContext,
    ) -> bool {
        self(manager, signal, info, context)
    }
}

/// Which bucket a handler is registered in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    /// Consulted only when the fault pc lies in generated code.
    GeneratedCode,
    /// Consulted for every fault no generated-code handler claimed.
    Other,
}

/// Identifies a registered handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "handler#{}", self.0)
    }
}

/// The two ordered handler buckets. Insertion order is priority order.
#[derive(Default)]
pub(crate) struct HandlerChain {
    generated_code: Vec<(HandlerId, Box<dyn FaultHandler>)>,
    other: Vec<(HandlerId, Box<dyn FaultHandler>)>,
    next_id: u64,
}

impl HandlerChain {
    pub(crate) fn add(&mut self, handler: Box<dyn FaultHandler>, kind: HandlerKind) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.bucket_mut(kind).push((id, handler));
        id
    }

    pub(crate) fn remove(&mut self, id: HandlerId) -> Option<Box<dyn FaultHandler>> {
        for kind in [HandlerKind::GeneratedCode, HandlerKind::Other] {
            let bucket = self.bucket_mut(kind);
            if let Some(position) = bucket.iter().position(|(entry, _)| *entry == id) {
                return Some(bucket.remove(position).1);
            }
        }
        None
    }

    pub(crate) fn bucket(&self, kind: HandlerKind) -> &[(HandlerId, Box<dyn FaultHandler>)] {
        match kind {
            HandlerKind::GeneratedCode => &self.generated_code,
            HandlerKind::Other => &self.other,
        }
    }

    fn bucket_mut(&mut self, kind: HandlerKind) -> &mut Vec<(HandlerId, Box<dyn FaultHandler>)> {
        match kind {
            HandlerKind::GeneratedCode => &mut self.generated_code,
            HandlerKind::Other => &mut self.other,
        }
    }

    pub(crate) fn len(&self, kind: HandlerKind) -> usize {
        self.bucket(kind).len()
    }

    pub(crate) fn clear(&mut self) {
        self.generated_code.clear();
        self.other.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declining(_: &FaultManager, _: libc::c_int, _: &FaultInfo, _: &mut SignalContext) -> bool {
        false
    }

    #[test]
    fn ids_are_unique_across_buckets() {
        let mut chain = HandlerChain::default();
        let a = chain.add(Box::new(declining), HandlerKind::GeneratedCode);
        let b = chain.add(Box::new(declining), HandlerKind::Other);
        let c = chain.add(Box::new(declining), HandlerKind::GeneratedCode);
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(chain.len(HandlerKind::GeneratedCode), 2);
        assert_eq!(chain.len(HandlerKind::Other), 1);
    }

    #[test]
    fn removal_keeps_order() {
        let mut chain = HandlerChain::default();
        let a = chain.add(Box::new(declining), HandlerKind::GeneratedCode);
        let b = chain.add(Box::new(declining), HandlerKind::GeneratedCode);
        let c = chain.add(Box::new(declining), HandlerKind::GeneratedCode);

        assert!(chain.remove(b).is_some());
        assert!(chain.remove(b).is_none());
        let ids: Vec<_> = chain
            .bucket(HandlerKind::GeneratedCode)
            .iter()
            .map(|(id, _)| *id)
            .collect();
        assert_eq!(ids, vec![a, c]);
    }

    #[test]
    fn display() {
        assert_eq!(HandlerId(3).to_string(), "handler#3");
    }
}
