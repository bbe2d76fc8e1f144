// Hints printed when the broker cannot be reached.

use tracing::error;

use crate::config::ConnectionConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Producer,
    Consumer,
    Listener,
}

pub fn troubleshooting_tips(config: &ConnectionConfig, queue: &str, role: Role) -> Vec<String> {
    let mut tips = vec![
        format!(
            "Verify the broker at {}:{} is running (rabbitmqctl status)",
            config.host, config.port
        ),
        format!(
            "Check that virtual host '{}' exists (rabbitmqctl list_vhosts)",
            config.queue_manager
        ),
        format!(
            "Check if queue '{}' exists (rabbitmqctl list_queues -p {} name messages)",
            queue, config.queue_manager
        ),
        format!(
            "Ensure the AMQP listener is active on port {} (rabbitmq-diagnostics listeners)",
            config.port
        ),
        format!(
            "Check authentication for user '{}' (MQ_USERNAME / MQ_PASSWORD)",
            config.username.as_deref().unwrap_or("guest")
        ),
    ];

    let permission = match role {
        Role::Producer => "write",
        Role::Consumer | Role::Listener => "read",
    };
    tips.push(format!(
        "Verify {} permissions on '{}' (rabbitmqctl list_permissions -p {})",
        permission, queue, config.queue_manager
    ));
    tips.push(format!(
        "Look for connection '{}' in the broker logs",
        config.channel
    ));
    tips
}

/// Logs every tip as a numbered line.
pub fn log_troubleshooting_tips(config: &ConnectionConfig, queue: &str, role: Role) {
    error!("Troubleshooting tips:");
    for (i, tip) in troubleshooting_tips(config, queue, role).iter().enumerate() {
        error!("{}. {}", i + 1, tip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tips_name_the_target() {
        let config = ConnectionConfig::new("mq.internal", 5673, "APP.SVRCONN", "orders");
        let tips = troubleshooting_tips(&config, "ORDERS.IN", Role::Producer);

        assert!(tips[0].contains("mq.internal:5673"));
        assert!(tips.iter().any(|t| t.contains("'orders'")));
        assert!(tips.iter().any(|t| t.contains("write permissions on 'ORDERS.IN'")));
        assert!(tips.last().unwrap().contains("APP.SVRCONN"));
    }

    #[test]
    fn test_consumers_need_read_permission() {
        let tips = troubleshooting_tips(&ConnectionConfig::default(), "Q", Role::Consumer);
        assert!(tips.iter().any(|t| t.contains("read permissions")));
    }
}
