pub(crate) mod backend;
pub(crate) mod claims;
pub(crate) mod observers;
pub(crate) mod refresh;
pub(crate) mod request;
pub(crate) mod state_machine;
pub(crate) mod token_exchange;
pub(crate) mod token_store;

#[cfg(test)]
pub(crate) mod testutil;
