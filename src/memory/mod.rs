pub(crate) mod allocation;
pub(crate) mod bucket;
pub(crate) mod error;
pub(crate) mod heap;
pub(crate) mod loom_tests;
pub(crate) mod metadata;
pub(crate) mod page;
pub(crate) mod page_source;
pub(crate) mod protection;
pub(crate) mod segment;
pub(crate) mod stats;
pub(crate) mod vm;
