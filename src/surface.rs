//! Surfaces and views.
//!
//! A surface is a client-owned pixel source; a view places it on the desktop
//! canvas with geometry and a z position. Views live in one global stack,
//! bottom to top, split into two bands: composed views below, float views
//! above. Bring-to-top raises a composed view to the top of the composed
//! band; falling drops it to the bottom of the stack. After every restack
//! the z positions are renumbered so they stay a total order.

use std::fmt;

use rustc_hash::FxHashMap;

use crate::buffer::BufferId;
use crate::client_agent::LinkId;
use crate::protocol::{CommitInfo, Rect};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u64);

impl fmt::Debug for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SurfaceId({:#x})", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewId(pub u64);

impl fmt::Debug for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ViewId({:#x})", self.0)
    }
}

/// A commit accepted from the client but not yet latched by a repaint pass.
#[derive(Debug, Clone, Copy)]
pub struct PendingCommit {
    pub buffer: BufferId,
    pub info: CommitInfo,
}

#[derive(Debug)]
pub struct Surface {
    pub id: SurfaceId,
    pub owner: LinkId,
    pub width: u32,
    pub height: u32,
    pub damage: Rect,
    pub opaque: Rect,
    pub is_opaque: bool,
    pub views: Vec<ViewId>,
    /// Latched content, in scanout or composition.
    pub current: Option<BufferId>,
    /// Accepted commit waiting for the next repaint tick.
    pub pending: Option<PendingCommit>,
    /// Renderer holds per-surface state for this surface.
    pub renderer_attached: bool,
}

impl Surface {
    pub fn new(id: SurfaceId, owner: LinkId, width: u32, height: u32) -> Surface {
        Surface {
            id,
            owner,
            width,
            height,
            damage: Rect::new(0, 0, width, height),
            opaque: Rect::default(),
            is_opaque: false,
            views: Vec::new(),
            current: None,
            pending: None,
            renderer_attached: false,
        }
    }
}

#[derive(Debug)]
pub struct View {
    pub id: ViewId,
    pub surface: SurfaceId,
    pub area: Rect,
    pub zpos: i32,
    pub alpha: f32,
    /// Stacks above all composed views.
    pub float_view: bool,
    pub full_screen: bool,
    pub requested_mask: u32,
    pub primary_output: u32,
    /// Outputs whose desktop rectangle currently intersects the view.
    pub visible_mask: u32,
    pub shown: bool,
    /// Plane assignment from the last repaint pass, `None` when composed.
    pub plane: Option<(usize, usize)>,
    pub dirty: bool,
    /// Insertion order, breaks z ties.
    pub seq: u64,
}

/// Global z-order, bottom to top.
#[derive(Debug, Default)]
pub struct ViewStack {
    order: Vec<ViewId>,
}

impl ViewStack {
    pub fn new() -> ViewStack {
        ViewStack::default()
    }

    fn renumber(&self, views: &mut FxHashMap<ViewId, View>) {
        for (z, id) in self.order.iter().enumerate() {
            if let Some(view) = views.get_mut(id) {
                view.zpos = z as i32;
            }
        }
    }

    /// Index of the first float view, which is also the end of the composed
    /// band.
    fn float_band_start(&self, views: &FxHashMap<ViewId, View>) -> usize {
        self.order
            .iter()
            .position(|id| views.get(id).is_some_and(|v| v.float_view))
            .unwrap_or(self.order.len())
    }

    /// New composed views go on top of the composed band; new float views on
    /// top of everything.
    pub fn insert(&mut self, views: &mut FxHashMap<ViewId, View>, id: ViewId) {
        let is_float = views.get(&id).is_some_and(|v| v.float_view);
        if is_float {
            self.order.push(id);
        } else {
            let at = self.float_band_start(views);
            self.order.insert(at, id);
        }
        self.renumber(views);
    }

    pub fn remove(&mut self, views: &mut FxHashMap<ViewId, View>, id: ViewId) {
        self.order.retain(|v| *v != id);
        self.renumber(views);
    }

    pub fn bring_to_top(&mut self, views: &mut FxHashMap<ViewId, View>, id: ViewId) {
        if !self.order.contains(&id) {
            return;
        }
        self.order.retain(|v| *v != id);
        let is_float = views.get(&id).is_some_and(|v| v.float_view);
        if is_float {
            self.order.push(id);
        } else {
            let at = self.float_band_start(views);
            self.order.insert(at, id);
        }
        self.renumber(views);
    }

    pub fn fall(&mut self, views: &mut FxHashMap<ViewId, View>, id: ViewId) {
        if !self.order.contains(&id) {
            return;
        }
        self.order.retain(|v| *v != id);
        self.order.insert(0, id);
        self.renumber(views);
    }

    pub fn bottom_up(&self) -> impl Iterator<Item = ViewId> + '_ {
        self.order.iter().copied()
    }

    pub fn top_down(&self) -> impl Iterator<Item = ViewId> + '_ {
        self.order.iter().rev().copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Topmost view of the composed band, if any.
    pub fn top_composed(&self, views: &FxHashMap<ViewId, View>) -> Option<ViewId> {
        self.order
            .iter()
            .rev()
            .find(|id| views.get(*id).is_some_and(|v| !v.float_view))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(id: u64, float_view: bool, seq: u64) -> View {
        View {
            id: ViewId(id),
            surface: SurfaceId(id),
            area: Rect::new(0, 0, 100, 100),
            zpos: 0,
            alpha: 1.0,
            float_view,
            full_screen: false,
            requested_mask: !0,
            primary_output: 0,
            visible_mask: 0,
            shown: true,
            plane: None,
            dirty: false,
            seq,
        }
    }

    fn setup(specs: &[(u64, bool)]) -> (ViewStack, FxHashMap<ViewId, View>) {
        let mut views = FxHashMap::default();
        let mut stack = ViewStack::new();
        for (seq, (id, float)) in specs.iter().enumerate() {
            views.insert(ViewId(*id), view(*id, *float, seq as u64));
            stack.insert(&mut views, ViewId(*id));
        }
        (stack, views)
    }

    fn order(stack: &ViewStack) -> Vec<u64> {
        stack.bottom_up().map(|v| v.0).collect()
    }

    #[test]
    fn floats_stay_above_composed_views() {
        let (stack, _views) = setup(&[(1, false), (2, true), (3, false), (4, true)]);
        assert_eq!(order(&stack), vec![1, 3, 2, 4]);
    }

    #[test]
    fn bring_to_top_tops_the_composed_band() {
        let (mut stack, mut views) = setup(&[(1, false), (2, false), (3, true)]);
        stack.bring_to_top(&mut views, ViewId(1));
        assert_eq!(order(&stack), vec![2, 1, 3]);
        assert_eq!(stack.top_composed(&views), Some(ViewId(1)));
    }

    #[test]
    fn fall_sinks_below_everything() {
        let (mut stack, mut views) = setup(&[(1, false), (2, false), (3, false)]);
        stack.fall(&mut views, ViewId(3));
        assert_eq!(order(&stack), vec![3, 1, 2]);
    }

    #[test]
    fn zpos_is_a_total_order_after_restacks() {
        let (mut stack, mut views) = setup(&[(1, false), (2, false), (3, true), (4, false)]);
        stack.bring_to_top(&mut views, ViewId(1));
        stack.fall(&mut views, ViewId(4));
        stack.bring_to_top(&mut views, ViewId(2));

        let mut zs: Vec<i32> = stack
            .bottom_up()
            .map(|id| views.get(&id).unwrap().zpos)
            .collect();
        assert!(zs.windows(2).all(|w| w[0] < w[1]));
        zs.sort_unstable();
        zs.dedup();
        assert_eq!(zs.len(), stack.len());
    }

    #[test]
    fn float_insertion_order_is_preserved() {
        let (mut stack, mut views) = setup(&[(1, true), (2, true), (3, false)]);
        assert_eq!(order(&stack), vec![3, 1, 2]);
        // Raising a float puts it above its float siblings.
        stack.bring_to_top(&mut views, ViewId(1));
        assert_eq!(order(&stack), vec![3, 2, 1]);
    }
}
