pub mod error;
pub mod gc {
    pub mod header;
}
pub mod smart_ptr {
    pub mod control_block;
    pub mod shared_ptr;
}
#[cfg(test)]
mod test_util;

pub use error::{ Result, SmartPtrError };
pub use gc::header::{ Headered, ObjectHeader };
pub use smart_ptr::shared_ptr::{ SharedPtr, Upcast };
