//! Object table: stable, order-independent identifiers for model objects.
//!
//! Reference slots encode as small table identifiers rather than raw
//! addresses, which makes state hashing byte-exact across runs and
//! processes. Identifier 0 is reserved for the null reference.

use crate::component::Stateful;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::Rc;

/// A shared handle to a stateful model object.
pub type ModelObject = Rc<RefCell<dyn Stateful>>;

/// Identifier of an object in the table. 0 is the null reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjRef(pub(crate) u16);

impl ObjRef {
    pub const NULL: ObjRef = ObjRef(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn index(self) -> u16 {
        self.0
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

/// Pointer identity of a model object, independent of its contents.
fn identity(obj: &ModelObject) -> usize {
    Rc::as_ptr(obj).cast::<()>() as usize
}

/// Maps the distinct stateful objects reachable from the model roots to
/// identifiers 1..=N and back. Immutable once built.
pub struct ObjectTable {
    /// Objects in identifier order; position 0 is unused (null).
    objects: Vec<ModelObject>,
    identifiers: HashMap<usize, ObjRef>,
}

impl ObjectTable {
    /// Build the table from the given roots, following
    /// [`Stateful::references`] transitively.
    ///
    /// Each object appears exactly once (identity, not value, equality).
    /// Objects are ordered by type name, then by discovery order, so two
    /// processes building the same logical model produce identical layouts.
    pub fn build(roots: &[ModelObject]) -> Self {
        let mut discovered: Vec<ModelObject> = Vec::new();
        let mut seen: HashMap<usize, ()> = HashMap::new();
        let mut pending: VecDeque<ModelObject> = roots.iter().cloned().collect();

        while let Some(obj) = pending.pop_front() {
            if seen.insert(identity(&obj), ()).is_some() {
                continue;
            }
            pending.extend(obj.borrow().references());
            discovered.push(obj);
        }

        // Stable: equal type names keep discovery order.
        discovered.sort_by_key(|obj| obj.borrow().type_name());

        let mut objects = Vec::with_capacity(discovered.len() + 1);
        // Placeholder for the null identifier; never dereferenced.
        if let Some(first) = discovered.first() {
            objects.push(first.clone());
        }
        let mut identifiers = HashMap::with_capacity(discovered.len());
        for obj in discovered {
            let id = ObjRef(objects.len() as u16);
            identifiers.insert(identity(&obj), id);
            objects.push(obj);
        }

        Self {
            objects,
            identifiers,
        }
    }

    /// Number of objects in the table, excluding the null entry.
    pub fn len(&self) -> usize {
        self.objects.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The identifier assigned to `obj`.
    ///
    /// # Panics
    ///
    /// Panics if the object is not in the table; serializing a reference to
    /// an unregistered object is a programming error.
    pub fn identifier_of(&self, obj: &ModelObject) -> ObjRef {
        match self.identifiers.get(&identity(obj)) {
            Some(&id) => id,
            None => panic!(
                "object of type '{}' is not part of the model",
                obj.borrow().type_name()
            ),
        }
    }

    /// The object with the given identifier; `None` for the null reference.
    pub fn object_at(&self, id: ObjRef) -> Option<ModelObject> {
        if id.is_null() {
            None
        } else {
            self.objects.get(id.0 as usize).cloned()
        }
    }

    /// Iterate over the objects in identifier order (1..=N).
    pub fn iter(&self) -> impl Iterator<Item = &ModelObject> {
        self.objects.iter().skip(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelResult;
    use crate::layout::{SlotReader, SlotWriter};
    use crate::slot::SchemaBuilder;

    struct Leaf;

    impl Stateful for Leaf {
        fn type_name(&self) -> &'static str {
            "tests::Leaf"
        }
        fn schema(&self, _b: &mut SchemaBuilder) {}
        fn encode(&self, _w: &mut SlotWriter<'_>) -> ModelResult<()> {
            Ok(())
        }
        fn decode(&mut self, _r: &mut SlotReader<'_>) -> ModelResult<()> {
            Ok(())
        }
    }

    struct Branch {
        child: ModelObject,
    }

    impl Stateful for Branch {
        fn type_name(&self) -> &'static str {
            "tests::Branch"
        }
        fn schema(&self, _b: &mut SchemaBuilder) {}
        fn encode(&self, _w: &mut SlotWriter<'_>) -> ModelResult<()> {
            Ok(())
        }
        fn decode(&mut self, _r: &mut SlotReader<'_>) -> ModelResult<()> {
            Ok(())
        }
        fn references(&self) -> Vec<ModelObject> {
            vec![self.child.clone()]
        }
    }

    #[test]
    fn test_identifiers_are_inverses() {
        let a: ModelObject = Rc::new(RefCell::new(Leaf));
        let b: ModelObject = Rc::new(RefCell::new(Leaf));
        let table = ObjectTable::build(&[a.clone(), b.clone()]);

        assert_eq!(table.len(), 2);
        for obj in [&a, &b] {
            let id = table.identifier_of(obj);
            let back = table.object_at(id).unwrap();
            assert!(Rc::ptr_eq(obj, &back));
        }
    }

    #[test]
    fn test_deduplicates_by_identity() {
        let a: ModelObject = Rc::new(RefCell::new(Leaf));
        let table = ObjectTable::build(&[a.clone(), a.clone()]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_reachable_objects_discovered() {
        let leaf: ModelObject = Rc::new(RefCell::new(Leaf));
        let branch: ModelObject = Rc::new(RefCell::new(Branch {
            child: leaf.clone(),
        }));
        let table = ObjectTable::build(&[branch.clone()]);
        assert_eq!(table.len(), 2);
        assert!(!table.identifier_of(&leaf).is_null());
    }

    #[test]
    fn test_order_by_type_name() {
        let leaf: ModelObject = Rc::new(RefCell::new(Leaf));
        let branch: ModelObject = Rc::new(RefCell::new(Branch {
            child: leaf.clone(),
        }));
        // Roots in both orders produce the same identifier assignment.
        let t1 = ObjectTable::build(&[branch.clone(), leaf.clone()]);
        let t2 = ObjectTable::build(&[leaf.clone(), branch.clone()]);
        assert_eq!(t1.identifier_of(&branch), t2.identifier_of(&branch));
        assert_eq!(t1.identifier_of(&leaf), t2.identifier_of(&leaf));
    }

    #[test]
    fn test_null_reference() {
        let table = ObjectTable::build(&[]);
        assert!(table.is_empty());
        assert!(table.object_at(ObjRef::NULL).is_none());
        assert_eq!(ObjRef::NULL.to_string(), "null");
    }

    #[test]
    #[should_panic(expected = "not part of the model")]
    fn test_unknown_object_fails_fast() {
        let a: ModelObject = Rc::new(RefCell::new(Leaf));
        let stranger: ModelObject = Rc::new(RefCell::new(Leaf));
        let table = ObjectTable::build(&[a]);
        table.identifier_of(&stranger);
    }
}
