//! # Internal Macros
//!
//! This module provides internal macros for reducing boilerplate in flatdb.
//!
//! ## zerocopy_accessors!
//!
//! Generates getter and setter methods for zerocopy struct fields that use
//! native-endian wrapper types (U32). On-disk integers are host byte order;
//! handles opened with the cross-endian conversion flag byte-swap whole
//! struct copies at the disk boundary instead of per-field.
//!
//! ### Usage
//!
//! ```ignore
//! use zerocopy::native_endian::U32;
//!
//! #[repr(C)]
//! struct Header {
//!     hash_size: U32,
//! }
//!
//! impl Header {
//!     zerocopy_accessors! {
//!         hash_size: u32,
//!     }
//! }
//!
//! // Generates:
//! // pub fn hash_size(&self) -> u32 { self.hash_size.get() }
//! // pub fn set_hash_size(&mut self, val: u32) { self.hash_size = U32::new(val); }
//! ```

/// Generates getter and setter methods for zerocopy native-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u32) {
                self.$field = ::zerocopy::native_endian::U32::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}
