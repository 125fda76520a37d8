//! Signature classification.
//!
//! A trampoline only needs to know, for each argument, which register file
//! the Win64 convention routes it through. [`Signature`] carries that list;
//! [`Signature::shape`] validates it into the hashable [`Shape`] that selects
//! a cached layout.
//!
//! The typed API derives signatures from Rust function pointer types via
//! [`NativeArg`], [`NativeRet`] and [`Callback`].

use std::fmt;
use std::ptr::NonNull;

use smallvec::SmallVec;

use crate::error::SignatureError;

/// Largest argument count a trampoline accepts.
///
/// Keeps the frame size and the stack-copy count within 32-bit immediates.
pub const MAX_ARGUMENTS: usize = 1 << 16;

/// How one argument is passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgClass {
    /// Integers, pointers and other word-sized scalars (RCX, RDX, R8, R9).
    Int,
    /// `f32` and `f64` (XMM0-XMM3).
    Float,
    /// A struct or union passed by value.
    Aggregate { size: usize },
    /// A SIMD vector passed by value.
    Vector,
}

/// How the return value comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetClass {
    Void,
    Int,
    Float,
    Aggregate { size: usize },
}

/// Register file of a validated argument slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotClass {
    Int,
    Float,
}

impl fmt::Display for SlotClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotClass::Int => f.write_str("i"),
            SlotClass::Float => f.write_str("f"),
        }
    }
}

/// Argument and return classification of a plain callback.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    args: SmallVec<[ArgClass; 8]>,
    ret: RetClass,
}

impl Signature {
    /// Build a signature from argument classes and a return class.
    pub fn new(args: impl IntoIterator<Item = ArgClass>, ret: RetClass) -> Self {
        Self {
            args: args.into_iter().collect(),
            ret,
        }
    }

    /// Signature with `count` integer arguments.
    pub fn ints(count: usize, ret: RetClass) -> Self {
        Self::new(std::iter::repeat_n(ArgClass::Int, count), ret)
    }

    /// Argument classes in order.
    #[inline]
    pub fn args(&self) -> &[ArgClass] {
        &self.args
    }

    /// Return class.
    #[inline]
    pub fn ret(&self) -> RetClass {
        self.ret
    }

    /// Number of arguments of the plain callback.
    #[inline]
    pub fn arity(&self) -> usize {
        self.args.len()
    }

    /// Check that every argument and the return fit the register window.
    pub fn shape(&self) -> Result<Shape, SignatureError> {
        if self.args.len() > MAX_ARGUMENTS {
            return Err(SignatureError::TooManyArguments(self.args.len()));
        }
        if let RetClass::Aggregate { size } = self.ret {
            return Err(SignatureError::AggregateReturn { size });
        }

        let slots = self
            .args
            .iter()
            .enumerate()
            .map(|(index, class)| match *class {
                ArgClass::Int => Ok(SlotClass::Int),
                ArgClass::Float => Ok(SlotClass::Float),
                ArgClass::Aggregate { size } => {
                    Err(SignatureError::AggregateArgument { index, size })
                }
                ArgClass::Vector => Err(SignatureError::VectorArgument { index }),
            })
            .collect::<Result<SmallVec<_>, _>>()?;

        Ok(Shape { slots })
    }
}

/// A validated signature: the per-slot register class of every argument.
///
/// The return class does not influence the generated code (RAX and XMM0
/// pass through untouched), so it is not part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    slots: SmallVec<[SlotClass; 8]>,
}

impl Shape {
    /// Slot classes of the original arguments.
    #[inline]
    pub fn slots(&self) -> &[SlotClass] {
        &self.slots
    }

    /// Number of original arguments.
    #[inline]
    pub fn arity(&self) -> usize {
        self.slots.len()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for slot in &self.slots {
            write!(f, "{}", slot)?;
        }
        f.write_str(")")
    }
}

// =============================================================================
// Typed classification
// =============================================================================

/// A type that travels in one Win64 argument slot.
///
/// # Safety
/// `CLASS` must match how the convention passes the type. A wrong class
/// makes the trampoline forward garbage.
pub unsafe trait NativeArg: Copy {
    const CLASS: ArgClass;
}

/// A type that can be returned from a callback.
///
/// # Safety
/// `CLASS` must match how the convention returns the type.
pub unsafe trait NativeRet {
    const CLASS: RetClass;
}

unsafe impl NativeRet for () {
    const CLASS: RetClass = RetClass::Void;
}

macro_rules! native_scalar {
    ($class:ident: $($ty:ty),* $(,)?) => {
        $(
            unsafe impl NativeArg for $ty {
                const CLASS: ArgClass = ArgClass::$class;
            }
            unsafe impl NativeRet for $ty {
                const CLASS: RetClass = RetClass::$class;
            }
        )*
    };
}

native_scalar!(Int: i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, bool, char);
native_scalar!(Float: f32, f64);

unsafe impl<T> NativeArg for *const T {
    const CLASS: ArgClass = ArgClass::Int;
}
unsafe impl<T> NativeRet for *const T {
    const CLASS: RetClass = RetClass::Int;
}
unsafe impl<T> NativeArg for *mut T {
    const CLASS: ArgClass = ArgClass::Int;
}
unsafe impl<T> NativeRet for *mut T {
    const CLASS: RetClass = RetClass::Int;
}
unsafe impl<T> NativeArg for NonNull<T> {
    const CLASS: ArgClass = ArgClass::Int;
}
unsafe impl<T> NativeArg for Option<&T> {
    const CLASS: ArgClass = ArgClass::Int;
}

/// A plain function pointer type that a closure over `T` can masquerade as.
///
/// Implemented for `extern "win64" fn(A1, .., An) -> R` and its `unsafe`
/// variant with up to twelve arguments. The matching [`Callback::Method`]
/// takes `&T` first and the same arguments after it.
///
/// # Safety
/// Implementations must report a [`Signature`] that matches the pointer
/// type and must only build `Self` from code implementing that signature.
pub unsafe trait Callback<T>: Copy {
    /// Function bound to the instance.
    type Method: Copy;

    /// Classification of the plain callback.
    fn signature() -> Signature;

    /// Entry address of a bound method.
    fn method_address(method: Self::Method) -> *const u8;

    /// Reinterpret code at `code` as this pointer type.
    ///
    /// # Safety
    /// `code` must point to executable code implementing this signature.
    unsafe fn from_code(code: *const u8) -> Self;
}

macro_rules! impl_callback {
    ($($arg:ident),*) => {
        #[cfg(target_arch = "x86_64")]
        unsafe impl<T, R: NativeRet, $($arg: NativeArg),*> Callback<T>
            for extern "win64" fn($($arg),*) -> R
        {
            type Method = for<'r> extern "win64" fn(&'r T $(, $arg)*) -> R;

            fn signature() -> Signature {
                Signature::new([$(<$arg as NativeArg>::CLASS),*], R::CLASS)
            }

            #[inline]
            fn method_address(method: Self::Method) -> *const u8 {
                method as *const u8
            }

            #[inline]
            unsafe fn from_code(code: *const u8) -> Self {
                unsafe { std::mem::transmute::<*const u8, Self>(code) }
            }
        }

        #[cfg(target_arch = "x86_64")]
        unsafe impl<T, R: NativeRet, $($arg: NativeArg),*> Callback<T>
            for unsafe extern "win64" fn($($arg),*) -> R
        {
            type Method = for<'r> unsafe extern "win64" fn(&'r T $(, $arg)*) -> R;

            fn signature() -> Signature {
                Signature::new([$(<$arg as NativeArg>::CLASS),*], R::CLASS)
            }

            #[inline]
            fn method_address(method: Self::Method) -> *const u8 {
                method as *const u8
            }

            #[inline]
            unsafe fn from_code(code: *const u8) -> Self {
                unsafe { std::mem::transmute::<*const u8, Self>(code) }
            }
        }
    };
}

impl_callback!();
impl_callback!(A1);
impl_callback!(A1, A2);
impl_callback!(A1, A2, A3);
impl_callback!(A1, A2, A3, A4);
impl_callback!(A1, A2, A3, A4, A5);
impl_callback!(A1, A2, A3, A4, A5, A6);
impl_callback!(A1, A2, A3, A4, A5, A6, A7);
impl_callback!(A1, A2, A3, A4, A5, A6, A7, A8);
impl_callback!(A1, A2, A3, A4, A5, A6, A7, A8, A9);
impl_callback!(A1, A2, A3, A4, A5, A6, A7, A8, A9, A10);
impl_callback!(A1, A2, A3, A4, A5, A6, A7, A8, A9, A10, A11);
impl_callback!(A1, A2, A3, A4, A5, A6, A7, A8, A9, A10, A11, A12);

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_of_scalars() {
        let sig = Signature::new(
            [ArgClass::Int, ArgClass::Float, ArgClass::Int],
            RetClass::Void,
        );
        let shape = sig.shape().unwrap();
        assert_eq!(
            shape.slots(),
            &[SlotClass::Int, SlotClass::Float, SlotClass::Int]
        );
        assert_eq!(shape.to_string(), "(ifi)");
    }

    #[test]
    fn test_return_class_not_part_of_shape() {
        let a = Signature::ints(2, RetClass::Int).shape().unwrap();
        let b = Signature::ints(2, RetClass::Float).shape().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_aggregates_and_vectors() {
        let sig = Signature::new(
            [ArgClass::Int, ArgClass::Aggregate { size: 24 }],
            RetClass::Void,
        );
        assert_eq!(
            sig.shape(),
            Err(SignatureError::AggregateArgument { index: 1, size: 24 })
        );

        let sig = Signature::new([ArgClass::Vector], RetClass::Void);
        assert_eq!(sig.shape(), Err(SignatureError::VectorArgument { index: 0 }));

        let sig = Signature::ints(1, RetClass::Aggregate { size: 16 });
        assert_eq!(sig.shape(), Err(SignatureError::AggregateReturn { size: 16 }));
    }

    #[test]
    fn test_rejects_excess_arity() {
        let sig = Signature::ints(MAX_ARGUMENTS + 1, RetClass::Void);
        assert_eq!(
            sig.shape(),
            Err(SignatureError::TooManyArguments(MAX_ARGUMENTS + 1))
        );
        assert!(Signature::ints(MAX_ARGUMENTS, RetClass::Void).shape().is_ok());
    }

    #[test]
    fn test_native_classes() {
        assert_eq!(<u8 as NativeArg>::CLASS, ArgClass::Int);
        assert_eq!(<char as NativeArg>::CLASS, ArgClass::Int);
        assert_eq!(<*const u8 as NativeArg>::CLASS, ArgClass::Int);
        assert_eq!(<Option<&u64> as NativeArg>::CLASS, ArgClass::Int);
        assert_eq!(<f32 as NativeArg>::CLASS, ArgClass::Float);
        assert_eq!(<f64 as NativeRet>::CLASS, RetClass::Float);
        assert_eq!(<() as NativeRet>::CLASS, RetClass::Void);
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn test_callback_signature() {
        struct Window;
        type KeyFn = extern "win64" fn(*mut Window, i32, i32, i32, i32);
        let sig = <KeyFn as Callback<()>>::signature();
        assert_eq!(sig.arity(), 5);
        assert_eq!(sig.ret(), RetClass::Void);

        type MixedFn = unsafe extern "win64" fn(i32, f32, *const u8) -> f64;
        let sig = <MixedFn as Callback<u32>>::signature();
        assert_eq!(
            sig.args(),
            &[ArgClass::Int, ArgClass::Float, ArgClass::Int]
        );
        assert_eq!(sig.ret(), RetClass::Float);
    }
}
