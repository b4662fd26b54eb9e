//! Scalar element type and the map/reduce operator pair
//!
//! The grid computes `C[n][m] = reduce_k map(A[n][k], B[k][m])`. With
//! [`Multiply`] and [`Add`] this is the ordinary matrix product; with
//! [`Add`] as the map and [`Max`]/[`Min`] as the reduce it is the
//! max-plus/min-plus (tropical) product.

use std::fmt::Debug;
use std::ops;

use num_traits::Zero;

/// A scalar that can travel through the grid
pub trait Element: Copy + Debug + PartialEq + Send + Sync + 'static {}

impl<T> Element for T where T: Copy + Debug + PartialEq + Send + Sync + 'static {}

/// Elementwise combination of an A value with a B value
pub trait MapOperator<T>: Send + Sync + 'static {
    fn apply(a: T, b: T) -> T;
}

/// Accumulation of mapped values along K
pub trait ReduceOperator<T>: Send + Sync + 'static {
    /// The value a reduction starts from; `apply(identity(), x) == x`.
    fn identity() -> T;

    fn apply(acc: T, value: T) -> T;
}

/// Ends of an element type's ordering, infinities included for floats
pub trait Extremes {
    fn lowest() -> Self;
    fn highest() -> Self;
}

macro_rules! impl_extremes {
    ($($ty:ty => $lowest:expr, $highest:expr;)*) => {
        $(
            impl Extremes for $ty {
                #[inline]
                fn lowest() -> Self {
                    $lowest
                }

                #[inline]
                fn highest() -> Self {
                    $highest
                }
            }
        )*
    };
}

impl_extremes! {
    i8 => i8::MIN, i8::MAX;
    i16 => i16::MIN, i16::MAX;
    i32 => i32::MIN, i32::MAX;
    i64 => i64::MIN, i64::MAX;
    i128 => i128::MIN, i128::MAX;
    isize => isize::MIN, isize::MAX;
    u8 => u8::MIN, u8::MAX;
    u16 => u16::MIN, u16::MAX;
    u32 => u32::MIN, u32::MAX;
    u64 => u64::MIN, u64::MAX;
    u128 => u128::MIN, u128::MAX;
    usize => usize::MIN, usize::MAX;
    f32 => f32::NEG_INFINITY, f32::INFINITY;
    f64 => f64::NEG_INFINITY, f64::INFINITY;
}

/// `a * b`
#[derive(Debug, Clone, Copy, Default)]
pub struct Multiply;

/// `a + b`, identity zero
#[derive(Debug, Clone, Copy, Default)]
pub struct Add;

/// `max(a, b)`, identity is the lowest value of the type (`-inf` for floats)
#[derive(Debug, Clone, Copy, Default)]
pub struct Max;

/// `min(a, b)`, identity is the highest value of the type (`+inf` for floats)
#[derive(Debug, Clone, Copy, Default)]
pub struct Min;

impl<T> MapOperator<T> for Multiply
where
    T: Element + ops::Mul<Output = T>,
{
    #[inline]
    fn apply(a: T, b: T) -> T {
        a * b
    }
}

impl<T> MapOperator<T> for Add
where
    T: Element + ops::Add<Output = T>,
{
    #[inline]
    fn apply(a: T, b: T) -> T {
        a + b
    }
}

impl<T> ReduceOperator<T> for Add
where
    T: Element + Zero,
{
    #[inline]
    fn identity() -> T {
        T::zero()
    }

    #[inline]
    fn apply(acc: T, value: T) -> T {
        acc + value
    }
}

impl<T> ReduceOperator<T> for Max
where
    T: Element + PartialOrd + Extremes,
{
    #[inline]
    fn identity() -> T {
        T::lowest()
    }

    #[inline]
    fn apply(acc: T, value: T) -> T {
        if value > acc {
            value
        } else {
            acc
        }
    }
}

impl<T> ReduceOperator<T> for Min
where
    T: Element + PartialOrd + Extremes,
{
    #[inline]
    fn identity() -> T {
        T::highest()
    }

    #[inline]
    fn apply(acc: T, value: T) -> T {
        if value < acc {
            value
        } else {
            acc
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identities() {
        assert_eq!(<Add as ReduceOperator<i64>>::identity(), 0);
        assert_eq!(<Max as ReduceOperator<i32>>::identity(), i32::MIN);
        assert_eq!(<Min as ReduceOperator<f32>>::identity(), f32::INFINITY);
        assert_eq!(<Max as ReduceOperator<f64>>::identity(), f64::NEG_INFINITY);
    }

    #[test]
    fn test_identity_is_neutral() {
        for x in [-7i64, 0, 3, 42] {
            assert_eq!(<Add as ReduceOperator<i64>>::apply(0, x), x);
            assert_eq!(<Max as ReduceOperator<i64>>::apply(i64::MIN, x), x);
            assert_eq!(<Min as ReduceOperator<i64>>::apply(i64::MAX, x), x);
        }
    }

    #[test]
    fn test_float_identity_keeps_infinities() {
        for x in [f64::NEG_INFINITY, -1.5, f64::MIN, 0.0, f64::MAX, f64::INFINITY] {
            let max_id = <Max as ReduceOperator<f64>>::identity();
            let min_id = <Min as ReduceOperator<f64>>::identity();
            assert_eq!(<Max as ReduceOperator<f64>>::apply(max_id, x), x);
            assert_eq!(<Min as ReduceOperator<f64>>::apply(min_id, x), x);
        }
    }

    #[test]
    fn test_maps() {
        assert_eq!(<Multiply as MapOperator<f64>>::apply(1.5, 4.0), 6.0);
        assert_eq!(<Add as MapOperator<i32>>::apply(-2, 5), 3);
    }
}
