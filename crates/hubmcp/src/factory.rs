use hubmcp_core::ProcessManager;
use std::sync::Arc;

/// Platform-independent factory that selects the appropriate implementation at compile time
pub struct PlatformProcessManagerFactory;

impl PlatformProcessManagerFactory {
    #[cfg(unix)]
    pub fn create_process_manager() -> Arc<dyn ProcessManager> {
        Arc::new(hubmcp_unix::UnixProcessManagerFactory::create_process_manager())
    }

    pub fn platform_name() -> &'static str {
        #[cfg(unix)]
        return hubmcp_unix::UnixProcessManagerFactory::platform_name();

        #[cfg(not(unix))]
        return "unsupported";
    }
}
