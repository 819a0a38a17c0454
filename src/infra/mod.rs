pub(crate) mod cookies;
pub(crate) mod settings;
pub(crate) mod storage;
