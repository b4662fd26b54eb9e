//! Fixed-width operand packs
//!
//! A pack is the unit moved through every channel of the grid. Its width is
//! fixed once the tiling plan is resolved and never changes in flight.

use std::ops::{Index, IndexMut};

use crate::ops::Element;

/// An ordered tuple of scalars moved atomically between stages
#[derive(Debug, Clone, PartialEq)]
pub struct Pack<T>(Box<[T]>);

impl<T: Element> Pack<T> {
    /// A pack with every slot set to `value`
    pub fn splat(value: T, width: usize) -> Self {
        Self(vec![value; width].into_boxed_slice())
    }

    pub fn from_slice(values: &[T]) -> Self {
        Self(values.into())
    }

    pub fn width(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.0.iter()
    }
}

impl<T> From<Vec<T>> for Pack<T> {
    fn from(values: Vec<T>) -> Self {
        Self(values.into_boxed_slice())
    }
}

impl<T> Index<usize> for Pack<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.0[index]
    }
}

impl<T> IndexMut<usize> for Pack<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.0[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splat_and_index() {
        let mut pack = Pack::splat(0i32, 3);
        assert_eq!(pack.width(), 3);
        pack[1] = 7;
        assert_eq!(pack.as_slice(), &[0, 7, 0]);
    }

    #[test]
    fn test_from_vec() {
        let pack: Pack<f32> = vec![1.0, 2.0].into();
        assert_eq!(pack.iter().copied().sum::<f32>(), 3.0);
        assert_eq!(pack, Pack::from_slice(&[1.0, 2.0]));
    }
}
