pub mod discovery;
pub mod downloader;
pub mod lifecycle;
pub mod manager;
pub mod server;
pub mod storage;
pub mod transfers;

#[cfg(test)]
pub(crate) mod test_support;
