use std::sync::Arc;
use std::time::Duration;

use pipelink_agent::{
    AgentError, AgentRegistry, DispatchClient, KeywordRouter, ReverseSkill, SkillSet,
    TaskResponder, UppercaseSkill,
};
use pipelink_mesh::{ChannelPool, ConfigError, LocalTransport, MeshConfig, MeshError, Transport};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Mesh(#[from] MeshError),

    #[error("Failed to encode output: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No built-in implementation for skill '{0}'")]
    UnsupportedSkill(String),
}

fn built_in_skills() -> SkillSet {
    SkillSet::new().with(ReverseSkill).with(UppercaseSkill)
}

fn local_transport(config: &MeshConfig) -> Arc<dyn Transport> {
    Arc::new(LocalTransport::new(config.socket_dir.clone()))
}

/// Cancel `cancel` on Ctrl-C
fn cancel_on_ctrl_c(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            cancel.cancel();
        }
    })
}

pub async fn serve_agent(skill: &str, address: Option<&str>) -> Result<(), CliError> {
    let config = MeshConfig::from_env()?;
    let registry = AgentRegistry::with_defaults();
    let registration = registry
        .resolve(skill)
        .ok_or_else(|| AgentError::UnresolvedAddress(skill.to_string()))?;

    let skills = built_in_skills();
    if !skills.contains(&registration.skill) {
        return Err(CliError::UnsupportedSkill(registration.skill.clone()));
    }

    let address = address.unwrap_or(registration.address.as_str());
    let responder = Arc::new(TaskResponder::new(
        registration.agent_id.clone(),
        KeywordRouter::new(),
        skills,
    ));

    let cancel = CancellationToken::new();
    let interrupt = cancel_on_ctrl_c(cancel.clone());
    info!(
        agent = %registration.agent_id,
        skill = %registration.skill,
        address = %address,
        "Starting agent"
    );

    let result = responder
        .run(local_transport(&config), address, &config, &cancel)
        .await;
    interrupt.abort();
    Ok(result?)
}

pub async fn send_request(text: &str, timeout_secs: Option<u64>) -> Result<(), CliError> {
    let mut config = MeshConfig::from_env()?;
    if let Some(secs) = timeout_secs {
        config.request_timeout = Duration::from_secs(secs);
        config.validate()?;
    }

    let pool = Arc::new(ChannelPool::new(local_transport(&config), config));
    let client = DispatchClient::new(Arc::new(AgentRegistry::with_defaults()), pool.clone());

    let cancel = CancellationToken::new();
    let interrupt = cancel_on_ctrl_c(cancel.clone());
    let outcome = client.dispatch(text, &cancel).await;
    interrupt.abort();
    pool.stop_all().await;

    println!("{}", serde_json::to_string_pretty(&outcome?)?);
    Ok(())
}

pub fn list_agents() -> Result<(), CliError> {
    let registry = AgentRegistry::with_defaults();
    println!("{}", serde_json::to_string_pretty(&registry.all())?);
    Ok(())
}
