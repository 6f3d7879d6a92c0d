//! Observer lists for lifecycle events.
//!
//! A `Signal<E>` is a flat list of boxed callbacks with stable handles.
//! Emission is synchronous and runs on the loop thread; listeners usually
//! capture an `Rc<RefCell<..>>` queue and defer real work to the caller, so
//! nothing is destroyed reentrantly from inside an emit.

use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Debug for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListenerId({})", self.0)
    }
}

pub struct Signal<E> {
    listeners: Vec<(ListenerId, Box<dyn FnMut(&E)>)>,
    next: u64,
}

impl<E> Default for Signal<E> {
    fn default() -> Self {
        Signal {
            listeners: Vec::new(),
            next: 1,
        }
    }
}

impl<E> Signal<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F: FnMut(&E) + 'static>(&mut self, f: F) -> ListenerId {
        let id = ListenerId(self.next);
        self.next += 1;
        self.listeners.push((id, Box::new(f)));
        id
    }

    /// Unregister a listener. Unknown ids are ignored so that subjects and
    /// observers can tear down in either order.
    pub fn remove(&mut self, id: ListenerId) {
        self.listeners.retain(|(l, _)| *l != id);
    }

    pub fn emit(&mut self, event: &E) {
        for (_, f) in self.listeners.iter_mut() {
            f(event);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }
}

impl<E> fmt::Debug for Signal<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn emit_reaches_all_listeners() {
        let hits = Rc::new(RefCell::new(Vec::new()));
        let mut sig = Signal::new();
        for n in 0..3 {
            let hits = hits.clone();
            sig.add(move |v: &u32| hits.borrow_mut().push((n, *v)));
        }
        sig.emit(&7);
        assert_eq!(&*hits.borrow(), &[(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    fn removed_listener_stops_firing() {
        let count = Rc::new(RefCell::new(0));
        let mut sig = Signal::new();
        let c = count.clone();
        let id = sig.add(move |_: &()| *c.borrow_mut() += 1);
        sig.emit(&());
        sig.remove(id);
        sig.emit(&());
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn remove_unknown_id_is_harmless() {
        let mut sig: Signal<()> = Signal::new();
        let id = sig.add(|_| {});
        sig.remove(id);
        sig.remove(id);
        assert!(sig.is_empty());
    }
}
