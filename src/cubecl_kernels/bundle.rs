use std::fmt::Debug;

/// A fixed set of tensors passed to or returned from a fused kernel.
///
/// The tensor count lives in the `Array` associated type, so kernels and
/// backends stay free of const generics.
pub trait TensorBundle<T: Debug + Clone + Send>: Sized + Clone + Send + Debug {
    /// `[T; N]` for an `N`-tensor bundle.
    type Array;
    type Mapped<U: Debug + Clone + Send>: TensorBundle<U, Array = Self::ArrayMapped<U>>;
    type ArrayMapped<U>;

    fn map<U: Debug + Clone + Send>(self, f: impl FnMut(T) -> U) -> Self::Mapped<U>;
    fn into_array(self) -> Self::Array;
    fn from_array(arr: Self::Array) -> Self;
}

/// Declares a named tensor bundle.
///
/// ```ignore
/// tensor_bundle! {
///     /// Query and key
///     pub struct QkInputs[2] { q, k }
/// }
/// ```
///
/// Generates the struct with public fields, its `TensorBundle` impl and the
/// `HasClient` impl used by the `Fusion` backend (which reads the client of
/// the first field).
#[macro_export]
macro_rules! tensor_bundle {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident [$n:literal] { $first_field:ident $(, $field:ident)* $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        $vis struct $name<T> {
            pub $first_field: T,
            $(pub $field: T,)*
        }

        impl<T: std::fmt::Debug + Clone + Send> $crate::cubecl_kernels::TensorBundle<T> for $name<T> {
            type Array = [T; $n];
            type Mapped<U: std::fmt::Debug + Clone + Send> = $name<U>;
            type ArrayMapped<U> = [U; $n];

            fn map<U: std::fmt::Debug + Clone + Send>(self, mut f: impl FnMut(T) -> U) -> $name<U> {
                $name {
                    $first_field: f(self.$first_field),
                    $($field: f(self.$field),)*
                }
            }

            fn into_array(self) -> [T; $n] {
                [self.$first_field $(, self.$field)*]
            }

            fn from_array(arr: [T; $n]) -> Self {
                let [$first_field $(, $field)*] = arr;
                $name {
                    $first_field,
                    $($field,)*
                }
            }
        }

        impl<B: burn_fusion::FusionBackend>
            $crate::cubecl_kernels::impls::HasClient<B>
            for $name<burn::tensor::ops::FloatTensor<burn_fusion::Fusion<B>>>
        {
            fn client(&self) -> &burn_fusion::client::GlobalFusionClient<B::FusionRuntime> {
                &self.$first_field.client
            }
        }
    };
}

pub use crate::tensor_bundle;

#[cfg(test)]
mod tests {
    use super::TensorBundle;

    crate::tensor_bundle! {
        struct Pair[2] { left, right }
    }

    #[test]
    fn map_preserves_field_order() {
        let pair = Pair { left: 1, right: 2 }.map(|x| x * 10);
        assert_eq!(pair.into_array(), [10, 20]);
        let back = Pair::from_array(["a", "b"]);
        assert_eq!((back.left, back.right), ("a", "b"));
    }
}
