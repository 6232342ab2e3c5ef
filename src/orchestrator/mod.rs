//! Session orchestration: registry, gateway, fallback strategy and the
//! background expiry sweep.

pub mod expiry;
pub mod fallback;
pub mod gateway;
pub mod session_registry;

use std::sync::Arc;

use tracing::info;

use crate::backend::sdk::{CliAgentClient, SdkBackend, SdkConfig};
use crate::backend::subprocess::{SubprocessBackend, SubprocessConfig};
use crate::config::GlobalConfig;
use crate::persistence::db::Database;
use crate::persistence::session_repo::SessionRepo;
use crate::policy::path_safety::WorkspaceConfinement;
use crate::policy::validator::ToolValidator;

use gateway::ExecutionGateway;
use session_registry::{RegistryConfig, SessionRegistry};

/// Wire a gateway from configuration.
///
/// The subprocess backend is always built. With `backend.use_sdk` the SDK
/// backend becomes primary and the subprocess backend its fallback.
/// Without `db` the registry is memory-only.
#[must_use]
pub fn build_gateway(config: &GlobalConfig, db: Option<Arc<Database>>) -> ExecutionGateway {
    let backend = &config.backend;
    let client = CliAgentClient::discover(backend.cli_path.clone())
        .with_envs(config.backend_env())
        .with_limits(backend.max_line_bytes, backend.read_chunk_bytes);

    let subprocess = Arc::new(SubprocessBackend::new(SubprocessConfig {
        executable: client.executable().to_path_buf(),
        max_turns: backend.max_turns,
        allowed_tools: config.tools.allowed.clone(),
        timeout: backend.timeout(),
        max_buffered_messages: backend.max_buffered_messages,
        read_chunk_bytes: backend.read_chunk_bytes,
        max_line_bytes: backend.max_line_bytes,
        envs: config.backend_env(),
    }));

    let registry = Arc::new(SessionRegistry::new(
        RegistryConfig {
            timeout_hours: config.sessions.timeout_hours,
            max_sessions_per_user: config.sessions.max_per_user,
        },
        db.map(SessionRepo::new),
    ));

    let validator = Arc::new(ToolValidator::new(
        config.tools.allowed.clone(),
        config.tools.disallowed.clone(),
        Arc::new(WorkspaceConfinement::new(config.approved_directory.clone())),
    ));

    let gateway = if backend.use_sdk {
        let sdk = Arc::new(SdkBackend::new(
            Arc::new(client),
            SdkConfig {
                max_turns: backend.max_turns,
                allowed_tools: config.tools.allowed.clone(),
                timeout: backend.timeout(),
                max_buffered_messages: backend.max_buffered_messages,
            },
        ));
        info!("gateway using sdk backend with subprocess fallback");
        ExecutionGateway::new(sdk, registry, validator).with_fallback(subprocess)
    } else {
        info!("gateway using subprocess backend");
        ExecutionGateway::new(subprocess, registry, validator)
    };

    gateway.with_critical_tools(config.tools.critical.clone())
}
