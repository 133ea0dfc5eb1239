//! Scope chain backing variable and function lookup.
//!
//! Frames live in an arena owned by the interpreter and refer to their parent by
//! [`ScopeId`]. Each frame holds four independent namespaces: scalar (`$x`), list
//! (`@x`), dictionary (`%x`) and functions. The same name may be bound in all four at
//! once without conflict.
//!
//! A frame is released when control leaves it, unless a closure captured it. Captured
//! frames are reclaimed by [`Scopes::collect`], which keeps every frame reachable from
//! the root, from a frame still in use, or from a closure held outside the arena.
//! Released slots are reused, so a [`ScopeId`] is only meaningful while its frame lives.

use std::collections::HashMap;
use std::rc::{Rc, Weak};

use tracing::trace;

use crate::Error;
use crate::ast::{Shape, Value};
use crate::evaluator::{Callable, UserFunction};

/// Live frame count that triggers the first collection
const COLLECTION_THRESHOLD: usize = 64;

/// Handle to a frame in a [`Scopes`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(usize);

#[derive(Debug, Default)]
struct Frame {
    parent: Option<ScopeId>,
    /// Indexed by [`Shape::index`]
    vars: [HashMap<String, Value>; 3],
    functions: HashMap<String, Callable>,
    /// Pushed and not popped yet
    active: bool,
    /// Some closure was defined here, so releasing waits for a collection
    captured: bool,
    /// Live frames naming this one as parent
    children: usize,
}

impl Frame {
    /// Call `f` for every closure bound in this frame, nested values included.
    fn for_each_closure(&self, f: &mut impl FnMut(&Rc<UserFunction>)) {
        for value in self.vars.iter().flat_map(HashMap::values) {
            closures_in(value, f);
        }
        for callable in self.functions.values() {
            if let Callable::User(function) = callable {
                f(function);
            }
        }
    }
}

fn closures_in(value: &Value, f: &mut impl FnMut(&Rc<UserFunction>)) {
    match value {
        Value::Function(Callable::User(function)) => f(function),
        Value::List(items) | Value::Expression(items) => {
            for item in items {
                closures_in(item, f);
            }
        }
        Value::Dictionary(entries) => {
            for (key, value) in entries {
                closures_in(key, f);
                closures_in(value, f);
            }
        }
        Value::Integer(_)
        | Value::Float(_)
        | Value::String(_)
        | Value::Atom(_)
        | Value::ScalarVar(_)
        | Value::ListVar(_)
        | Value::DictVar(_)
        | Value::Foreign(_)
        | Value::Function(Callable::Builtin(_) | Callable::Host(_)) => {}
    }
}

/// Arena of scope frames.
#[derive(Debug)]
pub struct Scopes {
    /// `None` marks a released slot
    frames: Vec<Option<Frame>>,
    free: Vec<usize>,
    /// Every closure created over a frame of this arena
    closures: Vec<Weak<UserFunction>>,
    next_collection: usize,
}

impl Default for Scopes {
    fn default() -> Self {
        Self::new()
    }
}

impl Scopes {
    /// Create an arena holding only the root frame.
    pub fn new() -> Self {
        Scopes {
            frames: vec![Some(Frame {
                active: true,
                ..Frame::default()
            })],
            free: Vec::new(),
            closures: Vec::new(),
            next_collection: COLLECTION_THRESHOLD,
        }
    }

    pub fn root(&self) -> ScopeId {
        ScopeId(0)
    }

    /// Number of live frames, the root included.
    pub fn frame_count(&self) -> usize {
        self.frames.len() - self.free.len()
    }

    fn frame(&self, scope: ScopeId) -> Option<&Frame> {
        self.frames.get(scope.0).and_then(Option::as_ref)
    }

    fn frame_mut(&mut self, scope: ScopeId) -> Option<&mut Frame> {
        self.frames.get_mut(scope.0).and_then(Option::as_mut)
    }

    pub fn parent(&self, scope: ScopeId) -> Option<ScopeId> {
        self.frame(scope).and_then(|frame| frame.parent)
    }

    /// Open a child frame of `parent`.
    pub fn push(&mut self, parent: ScopeId) -> ScopeId {
        if self.frame_count().max(self.closures.len()) >= self.next_collection {
            self.collect();
        }

        let frame = Frame {
            parent: Some(parent),
            active: true,
            ..Frame::default()
        };
        let id = match self.free.pop() {
            Some(slot) => {
                self.frames[slot] = Some(frame);
                ScopeId(slot)
            }
            None => {
                self.frames.push(Some(frame));
                ScopeId(self.frames.len() - 1)
            }
        };
        if let Some(parent) = self.frame_mut(parent) {
            parent.children += 1;
        }
        trace!(scope = id.0, parent = parent.0, "scope opened");
        id
    }

    /// Leave a frame once control returns past its creation point.
    ///
    /// A frame no closure captured and no live frame descends from is released at once.
    /// Others stay until a collection finds them unreachable.
    pub fn pop(&mut self, scope: ScopeId) {
        if scope == self.root() {
            return;
        }
        let Some(frame) = self.frame_mut(scope) else {
            return;
        };
        frame.active = false;
        if !frame.captured && frame.children == 0 {
            self.release(scope);
        }
    }

    /// Record a closure over `function.scope`; the frame outlives its call while the
    /// closure is reachable.
    pub fn capture(&mut self, function: &Rc<UserFunction>) {
        if let Some(frame) = self.frame_mut(function.scope) {
            frame.captured = true;
        }
        self.closures.push(Rc::downgrade(function));
    }

    fn release(&mut self, scope: ScopeId) {
        let Some(frame) = self.frames.get_mut(scope.0).and_then(Option::take) else {
            return;
        };
        if let Some(parent) = frame.parent.and_then(|parent| self.frame_mut(parent)) {
            parent.children = parent.children.saturating_sub(1);
        }
        self.free.push(scope.0);
        trace!(scope = scope.0, "scope released");
    }

    /// Release every frame that can no longer be reached.
    ///
    /// Roots are the root frame, frames not popped yet, and the defining frames of
    /// closures referenced from outside the arena: a closure whose strong count exceeds
    /// the references found inside live frames is held by the host or the evaluator.
    /// From the roots, parents and the frames of closures bound in reached frames are
    /// reachable too.
    pub fn collect(&mut self) {
        let mut held_inside: HashMap<*const UserFunction, usize> = HashMap::new();
        for frame in self.frames.iter().flatten() {
            frame.for_each_closure(&mut |function| {
                *held_inside.entry(Rc::as_ptr(function)).or_default() += 1;
            });
        }

        self.closures.retain(|closure| closure.strong_count() > 0);
        let mut pending: Vec<ScopeId> = self
            .frames
            .iter()
            .enumerate()
            .filter(|(_, frame)| frame.as_ref().is_some_and(|frame| frame.active))
            .map(|(slot, _)| ScopeId(slot))
            .collect();
        for closure in &self.closures {
            let inside = held_inside.get(&closure.as_ptr()).copied().unwrap_or(0);
            if closure.strong_count() > inside
                && let Some(function) = closure.upgrade()
            {
                pending.push(function.scope);
            }
        }

        let mut reached = vec![false; self.frames.len()];
        while let Some(id) = pending.pop() {
            let Some(frame) = self.frame(id) else {
                continue;
            };
            if std::mem::replace(&mut reached[id.0], true) {
                continue;
            }
            pending.extend(frame.parent);
            frame.for_each_closure(&mut |function| pending.push(function.scope));
        }

        let before = self.frame_count();
        for (slot, reached) in reached.into_iter().enumerate() {
            if !reached && self.frames[slot].is_some() {
                self.release(ScopeId(slot));
            }
        }
        self.closures.retain(|closure| closure.strong_count() > 0);
        self.next_collection = (2 * self.frame_count().max(self.closures.len()))
            .max(COLLECTION_THRESHOLD);
        trace!(
            released = before - self.frame_count(),
            live = self.frame_count(),
            "scopes collected"
        );
    }

    /// Iterate a frame and its ancestors, innermost first.
    fn chain(&self, scope: ScopeId) -> impl Iterator<Item = &Frame> {
        std::iter::successors(self.frame(scope), |frame| {
            frame.parent.and_then(|parent| self.frame(parent))
        })
    }

    /// Look a variable up in its own namespace along the chain.
    pub fn get(&self, scope: ScopeId, shape: Shape, name: &str) -> Option<&Value> {
        self.chain(scope)
            .find_map(|frame| frame.vars[shape.index()].get(name))
    }

    /// Look a variable up, falling back to the other two namespaces with coercion.
    ///
    /// The fallback order is scalar: list, dictionary; list: dictionary, scalar;
    /// dictionary: list, scalar. A binding found this way that cannot be read in the
    /// requested shape is a type error.
    pub fn get_coerced(
        &self,
        scope: ScopeId,
        shape: Shape,
        name: &str,
    ) -> Result<Option<Value>, Error> {
        if let Some(value) = self.get(scope, shape, name) {
            return Ok(Some(value.clone()));
        }
        for fallback in shape.fallbacks() {
            if let Some(value) = self.get(scope, fallback, name) {
                return value.coerce(shape).map(Some);
            }
        }
        Ok(None)
    }

    /// Assign to the nearest frame that already binds `name`, or bind it in `scope`.
    pub fn set(&mut self, scope: ScopeId, shape: Shape, name: &str, value: Value) {
        let mut current = Some(scope);
        while let Some(id) = current {
            let Some(frame) = self.frame_mut(id) else {
                break;
            };
            if let Some(slot) = frame.vars[shape.index()].get_mut(name) {
                *slot = value;
                return;
            }
            current = frame.parent;
        }
        self.define(scope, shape, name, value);
    }

    /// Bind `name` in `scope` itself, shadowing any outer binding.
    pub fn define(&mut self, scope: ScopeId, shape: Shape, name: &str, value: Value) {
        if let Some(frame) = self.frame_mut(scope) {
            frame.vars[shape.index()].insert(name.to_owned(), value);
        }
    }

    pub fn get_function(&self, scope: ScopeId, name: &str) -> Option<&Callable> {
        self.chain(scope).find_map(|frame| frame.functions.get(name))
    }

    pub fn define_function(&mut self, scope: ScopeId, name: &str, callable: Callable) {
        if let Some(frame) = self.frame_mut(scope) {
            frame.functions.insert(name.to_owned(), callable);
        }
    }

    /// All bindings visible from `scope`, sigil-prefixed and sorted by name.
    /// Functions are listed with a `&` prefix.
    pub fn bindings(&self, scope: ScopeId) -> Vec<(String, Value)> {
        let mut visible: HashMap<String, Value> = HashMap::new();
        // Innermost binding wins, so insert only what is not shadowed yet
        for frame in self.chain(scope) {
            for shape in [Shape::Scalar, Shape::List, Shape::Dictionary] {
                for (name, value) in &frame.vars[shape.index()] {
                    visible
                        .entry(format!("{}{name}", shape.sigil()))
                        .or_insert_with(|| value.clone());
                }
            }
            for (name, callable) in &frame.functions {
                visible
                    .entry(format!("&{name}"))
                    .or_insert_with(|| Value::Function(callable.clone()));
            }
        }

        let mut result: Vec<_> = visible.into_iter().collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));
        result
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::ast::{dict, val};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_namespaces_are_independent() {
        let mut scopes = Scopes::new();
        let root = scopes.root();
        scopes.define(root, Shape::Scalar, "x", val(1));
        scopes.define(root, Shape::List, "x", val([1, 2]));
        scopes.define(root, Shape::Dictionary, "x", dict(vec![("k", 3)]));

        assert_eq!(scopes.get(root, Shape::Scalar, "x"), Some(&val(1)));
        assert_eq!(scopes.get(root, Shape::List, "x"), Some(&val([1, 2])));
        assert_eq!(
            scopes.get(root, Shape::Dictionary, "x"),
            Some(&dict(vec![("k", 3)]))
        );
        assert_eq!(scopes.get(root, Shape::Scalar, "y"), None);
    }

    #[test]
    fn test_lookup_and_assignment_along_chain() {
        let mut scopes = Scopes::new();
        let root = scopes.root();
        scopes.define(root, Shape::Scalar, "outer", val(1));

        let child = scopes.push(root);
        let grandchild = scopes.push(child);

        // lookup walks outward
        assert_eq!(scopes.get(grandchild, Shape::Scalar, "outer"), Some(&val(1)));

        // set updates the frame that already binds the name
        scopes.set(grandchild, Shape::Scalar, "outer", val(2));
        assert_eq!(scopes.get(root, Shape::Scalar, "outer"), Some(&val(2)));

        // set of an unknown name binds it innermost
        scopes.set(grandchild, Shape::Scalar, "fresh", val(3));
        assert_eq!(scopes.get(grandchild, Shape::Scalar, "fresh"), Some(&val(3)));
        assert_eq!(scopes.get(child, Shape::Scalar, "fresh"), None);

        // define shadows without touching the outer binding
        scopes.define(grandchild, Shape::Scalar, "outer", val(9));
        assert_eq!(scopes.get(grandchild, Shape::Scalar, "outer"), Some(&val(9)));
        assert_eq!(scopes.get(root, Shape::Scalar, "outer"), Some(&val(2)));

        scopes.pop(grandchild);
        scopes.pop(child);
        assert_eq!(scopes.frame_count(), 1);
    }

    #[test]
    fn test_cross_namespace_lookup() {
        let mut scopes = Scopes::new();
        let root = scopes.root();
        scopes.define(root, Shape::List, "xs", val([1, 2, 3]));
        scopes.define(root, Shape::Dictionary, "d", dict(vec![("a", 1), ("b", 2)]));
        scopes.define(root, Shape::Scalar, "n", val(5));

        let test_cases = vec![
            (Shape::Scalar, "xs", Some(val(3))),
            (Shape::Scalar, "d", Some(val(2))),
            (
                Shape::List,
                "d",
                Some(val(vec![val("a"), val(1), val("b"), val(2)])),
            ),
            (Shape::Dictionary, "xs", None), // odd length cannot pair up
            (Shape::List, "n", None),        // a scalar never reads as a list
        ];

        for (shape, name, expected) in test_cases {
            let result = scopes.get_coerced(root, shape, name);
            match expected {
                Some(expected) => assert_eq!(result.unwrap(), Some(expected), "{name}"),
                None => assert!(result.is_err(), "{name}"),
            }
        }
        assert_eq!(scopes.get_coerced(root, Shape::List, "missing").unwrap(), None);

        // own namespace wins over the fallbacks
        scopes.define(root, Shape::Scalar, "xs", val("mine"));
        assert_eq!(
            scopes.get_coerced(root, Shape::Scalar, "xs").unwrap(),
            Some(val("mine"))
        );
    }

    fn closure_over(scope: ScopeId) -> Rc<UserFunction> {
        Rc::new(UserFunction {
            name: "f".to_owned(),
            params: Vec::new(),
            rest: None,
            body: Rc::from(Vec::new()),
            scope,
        })
    }

    #[test]
    fn test_frames_live_while_reachable() {
        let mut scopes = Scopes::new();
        let root = scopes.root();

        // nothing refers to a plain frame once it is popped
        let plain = scopes.push(root);
        scopes.pop(plain);
        assert_eq!(scopes.frame_count(), 1);

        let child = scopes.push(root);
        scopes.define(child, Shape::Scalar, "kept", val(1));
        let held = closure_over(child);
        scopes.capture(&held);
        scopes.pop(child);
        scopes.collect();
        assert_eq!(scopes.frame_count(), 2);
        assert_eq!(scopes.get(child, Shape::Scalar, "kept"), Some(&val(1)));

        // a closure bound only in the frame it closes over does not keep it alive
        scopes.define_function(child, "f", Callable::User(Rc::clone(&held)));
        drop(held);
        scopes.collect();
        assert_eq!(scopes.frame_count(), 1);

        // released slots are reused
        assert_eq!(scopes.push(root), child);

        // root is never released
        scopes.pop(child);
        scopes.pop(root);
        scopes.collect();
        assert_eq!(scopes.frame_count(), 1);
    }

    #[test]
    fn test_closure_in_live_frame_keeps_its_chain() {
        let mut scopes = Scopes::new();
        let root = scopes.root();
        let outer = scopes.push(root);
        let inner = scopes.push(outer);
        scopes.define(outer, Shape::Scalar, "n", val(5));

        let function = closure_over(inner);
        scopes.capture(&function);
        let held = val(vec![Value::Function(Callable::User(function))]);
        scopes.define(root, Shape::List, "fs", held);
        scopes.pop(inner);
        scopes.pop(outer);
        scopes.collect();
        assert_eq!(scopes.frame_count(), 3);
        assert_eq!(scopes.get(inner, Shape::Scalar, "n"), Some(&val(5)));

        scopes.define(root, Shape::List, "fs", val([0]));
        scopes.collect();
        assert_eq!(scopes.frame_count(), 1);
    }

    #[test]
    fn test_bindings_listing() {
        let mut scopes = Scopes::new();
        let root = scopes.root();
        scopes.define(root, Shape::Scalar, "b", val(1));
        scopes.define(root, Shape::List, "a", val([1]));
        let child = scopes.push(root);
        scopes.define(child, Shape::Scalar, "b", val(2));

        assert_eq!(
            scopes.bindings(child),
            vec![("$b".to_owned(), val(2)), ("@a".to_owned(), val([1]))]
        );
    }
}
