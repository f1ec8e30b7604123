//! The type descriptor: a tree of array/object nodes, each carrying the set
//! of properties that can change in place (`mutable_properties`).
//!
//! Descriptors are purely derived data. Steps compute their own descriptor
//! bottom-up from their upstream's descriptor and never reach into another
//! step's descriptor to mutate it. `type_descriptor()` must be pure and
//! return identical trees across calls (testable property #7).

use std::collections::BTreeSet;

use crate::path::PropName;

/// `TypeDescriptor := { arrays: [ArrayDescriptor], objects?: [ObjectDescriptor], mutable_properties?: set<string> }`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub arrays: Vec<ArrayDescriptor>,
    pub objects: Vec<ObjectDescriptor>,

    /// Properties at *this* level that some upstream step may emit
    /// `modified(segPath, name, ...)` for.
    pub mutable_properties: BTreeSet<PropName>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArrayDescriptor {
    pub name: PropName,
    pub ty: TypeDescriptor,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectDescriptor {
    pub name: PropName,
    pub ty: TypeDescriptor,
}

impl TypeDescriptor {
    pub fn is_mutable(&self, property: &str) -> bool {
        self.mutable_properties.iter().any(|p| &**p == property)
    }

    pub fn mark_mutable(&mut self, property: impl Into<PropName>) {
        self.mutable_properties.insert(property.into());
    }

    pub fn unmark_mutable(&mut self, property: &str) {
        self.mutable_properties.retain(|p| &**p != property);
    }

    pub fn array(&self, name: &str) -> Option<&ArrayDescriptor> {
        self.arrays.iter().find(|a| &*a.name == name)
    }

    pub fn array_mut(&mut self, name: &str) -> Option<&mut ArrayDescriptor> {
        self.arrays.iter_mut().find(|a| &*a.name == name)
    }

    /// Walks `seg` from this node, returning the descriptor at that level.
    pub fn at_path(&self, seg: &[PropName]) -> Option<&TypeDescriptor> {
        match seg.split_first() {
            None => Some(self),
            Some((head, rest)) => self.array(head).and_then(|a| a.ty.at_path(rest)),
        }
    }

    pub fn at_path_mut(&mut self, seg: &[PropName]) -> Option<&mut TypeDescriptor> {
        match seg.split_first() {
            None => Some(self),
            Some((head, rest)) => self.array_mut(head).map(|a| &mut a.ty).and_then(|ty| ty.at_path_mut(rest)),
        }
    }

    /// Inserts (or returns the existing) array descriptor named `name` at this level.
    pub fn ensure_array(&mut self, name: impl Into<PropName>) -> &mut TypeDescriptor {
        let name = name.into();
        if let Some(idx) = self.arrays.iter().position(|a| a.name == name) {
            &mut self.arrays[idx].ty
        } else {
            self.arrays.push(ArrayDescriptor {
                name,
                ty: TypeDescriptor::default(),
            });
            &mut self.arrays.last_mut().expect("just pushed").ty
        }
    }
}
