use anyhow::{bail, Context, Result};
use uuid::Uuid;

use crawlgate::config::GatewayConfig;
use crawlgate::intake::{MessageBroker, RedisQueueBroker, TaskMessage};
use crawlgate::utils::split_key_value;

/// Arguments for `crawlgate publish`
pub struct PublishParams {
    pub task_id: Option<String>,
    pub project: String,
    pub spider: String,
    pub settings: Vec<String>,
    pub args: Vec<String>,
    pub browser: bool,
    pub device_class: Option<String>,
    pub priority: i32,
}

/// Push one task message onto the intake queue
pub async fn publish(config: GatewayConfig, params: PublishParams) -> Result<()> {
    let PublishParams {
        task_id,
        project,
        spider,
        settings,
        args,
        browser,
        device_class,
        priority,
    } = params;

    let mut message = TaskMessage::new(
        task_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
        project,
        spider,
    );
    for pair in settings {
        let Some((key, value)) = split_key_value(&pair) else {
            bail!("Invalid --setting '{pair}', expected KEY=VALUE");
        };
        message.settings.insert(key, value);
    }
    for pair in args {
        let Some((key, value)) = split_key_value(&pair) else {
            bail!("Invalid --arg '{pair}', expected KEY=VALUE");
        };
        message.args.insert(key, value);
    }
    message.browser = browser.then_some(true);
    message.user_agent_type = device_class;
    message.priority = priority;

    let broker = RedisQueueBroker::connect(config.intake_redis_url(), &config.intake)
        .await
        .context("Failed to connect to the task queue")?;
    broker
        .publish(&message.to_json()?)
        .await
        .context("Failed to publish task")?;

    tracing::info!(task_id = %message.task_id, queue = %broker.queue_name(), "Task published");
    println!("{}", message.task_id);
    Ok(())
}
