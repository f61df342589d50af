//! Intrusive red-black trees with optional subtree augmentation.
//!
//! The allocator's bookkeeping lives *inside* the memory it manages: block
//! and span headers embed one [`Links`] struct per tree they participate in,
//! and the tree operates on raw node pointers. Nothing here allocates.
//!
//! A tree is parameterized by an [`RbAdapter`] that locates the link set
//! inside a node, orders nodes, and (optionally) maintains augmented data.
//! Augments are recomputed bottom-up on every structural change, so ordered
//! descents over augmented data (e.g. "smallest span with a large-enough
//! hole") stay O(log n).

use core::cmp::Ordering;
use core::marker::PhantomData;
use core::ptr::null_mut;

/// Link set one tree uses inside a node. A node participating in two trees
/// embeds two of these.
pub(crate) struct Links<N> {
    parent: *mut N,
    pub(crate) left: *mut N,
    pub(crate) right: *mut N,
    red: bool,
}

impl<N> Links<N> {
    pub(crate) const fn new() -> Self {
        Self {
            parent: null_mut(),
            left: null_mut(),
            right: null_mut(),
            red: false,
        }
    }
}

/// Glue between a tree and the nodes it threads through.
///
/// # Safety
/// `links` must return a stable pointer to a `Links` field inside `node`,
/// distinct from every other adapter used on the same node type.
pub(crate) unsafe trait RbAdapter {
    type Node;

    /// The link set this tree uses inside `node`.
    fn links(node: *mut Self::Node) -> *mut Links<Self::Node>;

    /// Strict ordering for insertion (`a` sorts before `b`).
    ///
    /// # Safety
    /// Both pointers reference live nodes.
    unsafe fn less(a: *const Self::Node, b: *const Self::Node) -> bool;

    /// Recompute augmented data of `node` from its children.
    ///
    /// # Safety
    /// `node` references a live node linked through this adapter.
    unsafe fn update_augment(node: *mut Self::Node) {
        let _ = node;
    }
}

/// Left child of `node` through adapter `A` (for custom augmented descents).
///
/// # Safety
/// `node` is live and linked through `A`.
pub(crate) unsafe fn links_left<A: RbAdapter>(node: *mut A::Node) -> *mut A::Node {
    unsafe { (*A::links(node)).left }
}

/// Right child of `node` through adapter `A`.
///
/// # Safety
/// `node` is live and linked through `A`.
pub(crate) unsafe fn links_right<A: RbAdapter>(node: *mut A::Node) -> *mut A::Node {
    unsafe { (*A::links(node)).right }
}

pub(crate) struct RbTree<A: RbAdapter> {
    root: *mut A::Node,
    _adapter: PhantomData<A>,
}

impl<A: RbAdapter> RbTree<A> {
    pub(crate) const fn new() -> Self {
        Self {
            root: null_mut(),
            _adapter: PhantomData,
        }
    }

    pub(crate) const fn root(&self) -> *mut A::Node {
        self.root
    }

    pub(crate) const fn is_empty(&self) -> bool {
        self.root.is_null()
    }

    // Link accessors; `n` must be non-null and linked through this adapter.

    unsafe fn parent(n: *mut A::Node) -> *mut A::Node {
        unsafe { (*A::links(n)).parent }
    }

    unsafe fn left(n: *mut A::Node) -> *mut A::Node {
        unsafe { (*A::links(n)).left }
    }

    unsafe fn right(n: *mut A::Node) -> *mut A::Node {
        unsafe { (*A::links(n)).right }
    }

    unsafe fn is_red(n: *mut A::Node) -> bool {
        unsafe { (*A::links(n)).red }
    }

    unsafe fn set_parent(n: *mut A::Node, p: *mut A::Node) {
        unsafe { (*A::links(n)).parent = p }
    }

    unsafe fn set_left(n: *mut A::Node, c: *mut A::Node) {
        unsafe { (*A::links(n)).left = c }
    }

    unsafe fn set_right(n: *mut A::Node, c: *mut A::Node) {
        unsafe { (*A::links(n)).right = c }
    }

    unsafe fn set_red(n: *mut A::Node, red: bool) {
        unsafe { (*A::links(n)).red = red }
    }

    /// Whether a (possibly null) node counts as black.
    unsafe fn is_black(n: *mut A::Node) -> bool {
        n.is_null() || !unsafe { Self::is_red(n) }
    }

    unsafe fn update_to_root(&mut self, mut n: *mut A::Node) {
        unsafe {
            while !n.is_null() {
                A::update_augment(n);
                n = Self::parent(n);
            }
        }
    }

    unsafe fn rotate_left(&mut self, x: *mut A::Node) {
        unsafe {
            let y = Self::right(x);
            let yl = Self::left(y);
            Self::set_right(x, yl);
            if !yl.is_null() {
                Self::set_parent(yl, x);
            }
            let xp = Self::parent(x);
            Self::set_parent(y, xp);
            if xp.is_null() {
                self.root = y;
            } else if Self::left(xp) == x {
                Self::set_left(xp, y);
            } else {
                Self::set_right(xp, y);
            }
            Self::set_left(y, x);
            Self::set_parent(x, y);
            A::update_augment(x);
            A::update_augment(y);
        }
    }

    unsafe fn rotate_right(&mut self, x: *mut A::Node) {
        unsafe {
            let y = Self::left(x);
            let yr = Self::right(y);
            Self::set_left(x, yr);
            if !yr.is_null() {
                Self::set_parent(yr, x);
            }
            let xp = Self::parent(x);
            Self::set_parent(y, xp);
            if xp.is_null() {
                self.root = y;
            } else if Self::left(xp) == x {
                Self::set_left(xp, y);
            } else {
                Self::set_right(xp, y);
            }
            Self::set_right(y, x);
            Self::set_parent(x, y);
            A::update_augment(x);
            A::update_augment(y);
        }
    }

    /// Insert `node`. Its link set for this adapter is overwritten.
    ///
    /// # Safety
    /// `node` is live, not currently in this tree, and stays pinned while
    /// linked.
    pub(crate) unsafe fn insert(&mut self, node: *mut A::Node) {
        unsafe {
            *A::links(node) = Links::new();
            let mut parent = null_mut();
            let mut cur = self.root;
            let mut went_left = false;
            while !cur.is_null() {
                parent = cur;
                went_left = A::less(node, cur);
                cur = if went_left {
                    Self::left(cur)
                } else {
                    Self::right(cur)
                };
            }
            Self::set_parent(node, parent);
            if parent.is_null() {
                self.root = node;
            } else if went_left {
                Self::set_left(parent, node);
            } else {
                Self::set_right(parent, node);
            }
            Self::set_red(node, true);
            self.update_to_root(node);
            self.insert_fixup(node);
        }
    }

    unsafe fn insert_fixup(&mut self, mut z: *mut A::Node) {
        unsafe {
            loop {
                let p = Self::parent(z);
                if p.is_null() || !Self::is_red(p) {
                    break;
                }
                // p is red, so it cannot be the root and g exists
                let g = Self::parent(p);
                if p == Self::left(g) {
                    let u = Self::right(g);
                    if !u.is_null() && Self::is_red(u) {
                        Self::set_red(p, false);
                        Self::set_red(u, false);
                        Self::set_red(g, true);
                        z = g;
                    } else {
                        if z == Self::right(p) {
                            z = p;
                            self.rotate_left(z);
                        }
                        let p = Self::parent(z);
                        let g = Self::parent(p);
                        Self::set_red(p, false);
                        Self::set_red(g, true);
                        self.rotate_right(g);
                    }
                } else {
                    let u = Self::left(g);
                    if !u.is_null() && Self::is_red(u) {
                        Self::set_red(p, false);
                        Self::set_red(u, false);
                        Self::set_red(g, true);
                        z = g;
                    } else {
                        if z == Self::left(p) {
                            z = p;
                            self.rotate_right(z);
                        }
                        let p = Self::parent(z);
                        let g = Self::parent(p);
                        Self::set_red(p, false);
                        Self::set_red(g, true);
                        self.rotate_left(g);
                    }
                }
            }
            Self::set_red(self.root, false);
        }
    }

    /// Replace the subtree rooted at `u` with the one rooted at `v`.
    unsafe fn transplant(&mut self, u: *mut A::Node, v: *mut A::Node) {
        unsafe {
            let up = Self::parent(u);
            if up.is_null() {
                self.root = v;
            } else if Self::left(up) == u {
                Self::set_left(up, v);
            } else {
                Self::set_right(up, v);
            }
            if !v.is_null() {
                Self::set_parent(v, up);
            }
        }
    }

    /// Unlink `node` from the tree.
    ///
    /// # Safety
    /// `node` is currently linked in this tree.
    pub(crate) unsafe fn remove(&mut self, node: *mut A::Node) {
        unsafe {
            let z = node;
            let mut removed_red = Self::is_red(z);
            let x: *mut A::Node;
            let x_parent: *mut A::Node;

            if Self::left(z).is_null() {
                x = Self::right(z);
                x_parent = Self::parent(z);
                self.transplant(z, x);
            } else if Self::right(z).is_null() {
                x = Self::left(z);
                x_parent = Self::parent(z);
                self.transplant(z, x);
            } else {
                // splice out the in-order successor
                let y = Self::subtree_min(Self::right(z));
                removed_red = Self::is_red(y);
                x = Self::right(y);
                if Self::parent(y) == z {
                    x_parent = y;
                } else {
                    x_parent = Self::parent(y);
                    self.transplant(y, x);
                    Self::set_right(y, Self::right(z));
                    Self::set_parent(Self::right(y), y);
                }
                self.transplant(z, y);
                Self::set_left(y, Self::left(z));
                Self::set_parent(Self::left(y), y);
                Self::set_red(y, Self::is_red(z));
            }

            if !x_parent.is_null() {
                self.update_to_root(x_parent);
            }
            if !removed_red {
                self.remove_fixup(x, x_parent);
            }
            *A::links(z) = Links::new();
        }
    }

    unsafe fn remove_fixup(&mut self, mut x: *mut A::Node, mut xp: *mut A::Node) {
        unsafe {
            while x != self.root && Self::is_black(x) {
                if xp.is_null() {
                    break;
                }
                if x == Self::left(xp) {
                    let mut w = Self::right(xp);
                    if Self::is_red(w) {
                        Self::set_red(w, false);
                        Self::set_red(xp, true);
                        self.rotate_left(xp);
                        w = Self::right(xp);
                    }
                    if Self::is_black(Self::left(w)) && Self::is_black(Self::right(w)) {
                        Self::set_red(w, true);
                        x = xp;
                        xp = Self::parent(x);
                    } else {
                        if Self::is_black(Self::right(w)) {
                            Self::set_red(Self::left(w), false);
                            Self::set_red(w, true);
                            self.rotate_right(w);
                            w = Self::right(xp);
                        }
                        Self::set_red(w, Self::is_red(xp));
                        Self::set_red(xp, false);
                        Self::set_red(Self::right(w), false);
                        self.rotate_left(xp);
                        x = self.root;
                        break;
                    }
                } else {
                    let mut w = Self::left(xp);
                    if Self::is_red(w) {
                        Self::set_red(w, false);
                        Self::set_red(xp, true);
                        self.rotate_right(xp);
                        w = Self::left(xp);
                    }
                    if Self::is_black(Self::right(w)) && Self::is_black(Self::left(w)) {
                        Self::set_red(w, true);
                        x = xp;
                        xp = Self::parent(x);
                    } else {
                        if Self::is_black(Self::left(w)) {
                            Self::set_red(Self::right(w), false);
                            Self::set_red(w, true);
                            self.rotate_left(w);
                            w = Self::left(xp);
                        }
                        Self::set_red(w, Self::is_red(xp));
                        Self::set_red(xp, false);
                        Self::set_red(Self::left(w), false);
                        self.rotate_right(xp);
                        x = self.root;
                        break;
                    }
                }
            }
            if !x.is_null() {
                Self::set_red(x, false);
            }
        }
    }

    unsafe fn subtree_min(mut n: *mut A::Node) -> *mut A::Node {
        unsafe {
            while !Self::left(n).is_null() {
                n = Self::left(n);
            }
            n
        }
    }

    unsafe fn subtree_max(mut n: *mut A::Node) -> *mut A::Node {
        unsafe {
            while !Self::right(n).is_null() {
                n = Self::right(n);
            }
            n
        }
    }

    /// Smallest node, or null.
    pub(crate) unsafe fn min(&self) -> *mut A::Node {
        if self.root.is_null() {
            null_mut()
        } else {
            unsafe { Self::subtree_min(self.root) }
        }
    }

    /// Greatest node, or null.
    pub(crate) unsafe fn max(&self) -> *mut A::Node {
        if self.root.is_null() {
            null_mut()
        } else {
            unsafe { Self::subtree_max(self.root) }
        }
    }

    /// In-order successor of a linked node, or null.
    pub(crate) unsafe fn next(node: *mut A::Node) -> *mut A::Node {
        unsafe {
            if !Self::right(node).is_null() {
                return Self::subtree_min(Self::right(node));
            }
            let mut c = node;
            let mut p = Self::parent(c);
            while !p.is_null() && c == Self::right(p) {
                c = p;
                p = Self::parent(p);
            }
            p
        }
    }

    /// In-order predecessor of a linked node, or null.
    pub(crate) unsafe fn prev(node: *mut A::Node) -> *mut A::Node {
        unsafe {
            if !Self::left(node).is_null() {
                return Self::subtree_max(Self::left(node));
            }
            let mut c = node;
            let mut p = Self::parent(c);
            while !p.is_null() && c == Self::left(p) {
                c = p;
                p = Self::parent(p);
            }
            p
        }
    }

    /// Greatest node that `cmp` reports as `Less` or `Equal` to the probe,
    /// or null. `cmp` compares a node against the probe value.
    pub(crate) unsafe fn floor_by(
        &self,
        cmp: impl Fn(*const A::Node) -> Ordering,
    ) -> *mut A::Node {
        unsafe {
            let mut best = null_mut();
            let mut cur = self.root;
            while !cur.is_null() {
                if cmp(cur) == Ordering::Greater {
                    cur = Self::left(cur);
                } else {
                    best = cur;
                    cur = Self::right(cur);
                }
            }
            best
        }
    }

    /// Smallest node that `cmp` reports as `Greater` or `Equal` to the
    /// probe, or null.
    pub(crate) unsafe fn ceil_by(&self, cmp: impl Fn(*const A::Node) -> Ordering) -> *mut A::Node {
        unsafe {
            let mut best = null_mut();
            let mut cur = self.root;
            while !cur.is_null() {
                if cmp(cur) == Ordering::Less {
                    cur = Self::right(cur);
                } else {
                    best = cur;
                    cur = Self::left(cur);
                }
            }
            best
        }
    }

    /// In-order traversal.
    pub(crate) unsafe fn for_each(&self, mut f: impl FnMut(*mut A::Node)) {
        unsafe {
            let mut n = self.min();
            while !n.is_null() {
                let next = Self::next(n);
                f(n);
                n = next;
            }
        }
    }

    /// Validate the red-black and parent-link invariants (test aid).
    #[cfg(test)]
    pub(crate) unsafe fn validate(&self) {
        unsafe {
            if self.root.is_null() {
                return;
            }
            assert!(!Self::is_red(self.root), "root must be black");
            assert!(Self::parent(self.root).is_null());
            Self::validate_subtree(self.root);
        }
    }

    #[cfg(test)]
    unsafe fn validate_subtree(n: *mut A::Node) -> usize {
        unsafe {
            if n.is_null() {
                return 1;
            }
            let l = Self::left(n);
            let r = Self::right(n);
            if !l.is_null() {
                assert!(Self::parent(l) == n, "parent link broken");
                assert!(!A::less(n, l), "BST order broken (left)");
            }
            if !r.is_null() {
                assert!(Self::parent(r) == n, "parent link broken");
                assert!(!A::less(r, n), "BST order broken (right)");
            }
            if Self::is_red(n) {
                assert!(Self::is_black(l) && Self::is_black(r), "red-red violation");
            }
            let lh = Self::validate_subtree(l);
            let rh = Self::validate_subtree(r);
            assert_eq!(lh, rh, "black height mismatch");
            lh + usize::from(!Self::is_red(n))
        }
    }
}
