//! Internal macros.
//!
//! `zerocopy_accessors!` generates getter and setter methods for struct
//! fields stored as zerocopy little-endian wrapper types (`U16`, `U32`,
//! `I32`), so on-disk codec structs expose native integers at the API
//! surface:
//!
//! ```ignore
//! impl IndexMetaPage {
//!     zerocopy_accessors! {
//!         root_page: u32,
//!         attr_byte_offset: i32,
//!     }
//! }
//! // expands to root_page() / set_root_page() / attr_byte_offset() / ...
//! ```

/// Generates getter and setter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u16) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u16 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u16) {
                self.$field = ::zerocopy::little_endian::U16::new(val);
            }
        }
    };
    (@impl $field:ident, u32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u32) {
                self.$field = ::zerocopy::little_endian::U32::new(val);
            }
        }
    };
    (@impl $field:ident, i32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> i32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: i32) {
                self.$field = ::zerocopy::little_endian::I32::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}
