pub mod cnmt;
pub mod hfs;
pub mod nca;
pub mod pfs;
pub mod ticket;
