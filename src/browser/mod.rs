pub mod cdp;
pub mod page;
pub mod session;

pub use cdp::CdpError;
pub use page::ChatPage;
pub use session::BrowserSession;

/// Whether `err` means the browser connection is gone for good.
pub fn is_session_lost(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<CdpError>())
        .any(CdpError::is_session_lost)
}
