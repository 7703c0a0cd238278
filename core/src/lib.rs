pub mod ir;
pub mod native;
pub mod rt;
pub mod typ;
pub mod util;
pub mod val;
pub mod vm;
