//! `tether connect`: handshake with an endpoint and report the session.

use super::TransportKind;
use anyhow::Context;
use std::sync::Arc;
use tether_mcp::{
    Capability, Client, ClientOptions, Implementation, InitializeResult, StdioCommand,
    StreamableHttpClientTransport, StdioTransport, TetherConfig, Transport, WebSocketTransport,
};
use tracing::debug;

pub async fn run(
    mut config: TetherConfig,
    transport: TransportKind,
    target: &str,
    token: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let request_timeout = config.request_timeout();
    let transport: Arc<dyn Transport> = match transport {
        TransportKind::Stdio => {
            let command = StdioCommand::parse(target)
                .with_context(|| format!("Empty command line: '{}'", target))?;
            Arc::new(StdioTransport::spawn(&command, config.stdio)?)
        }
        TransportKind::Ws => {
            config.websocket.auth_token = token.or(config.websocket.auth_token);
            Arc::new(WebSocketTransport::connect(target, config.websocket).await?)
        }
        TransportKind::Http => {
            config.http.auth_token = token.or(config.http.auth_token);
            Arc::new(StreamableHttpClientTransport::new(target, config.http)?)
        }
    };

    let client = Client::with_options(
        Implementation::new("tether", env!("CARGO_PKG_VERSION")),
        ClientOptions {
            request_timeout,
            ..Default::default()
        },
    );
    let init = client
        .connect(transport)
        .await
        .with_context(|| format!("Handshake with {} failed", target))?;
    debug!(version = %init.protocol_version, "connected");

    let tools = if init.capabilities.supports(Capability::Tools) {
        let listed = client.request("tools/list", None).await?;
        listed["tools"]
            .as_array()
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(|t| t["name"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    } else {
        Vec::new()
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&init)?);
    } else {
        print!("{}", render(&init, &tools));
    }

    client.close().await?;
    Ok(())
}

fn render(init: &InitializeResult, tools: &[String]) -> String {
    let mut out = format!(
        "Server:       {} {}\nProtocol:     {}\n",
        init.server_info.name, init.server_info.version, init.protocol_version
    );
    let capabilities: Vec<&str> = init.capabilities.names().collect();
    if capabilities.is_empty() {
        out.push_str("Capabilities: (none)\n");
    } else {
        out.push_str(&format!("Capabilities: {}\n", capabilities.join(", ")));
    }
    if !tools.is_empty() {
        out.push_str(&format!("Tools:        {}\n", tools.join(", ")));
    }
    if let Some(instructions) = &init.instructions {
        out.push_str(&format!("Instructions: {}\n", instructions));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_mcp::Capabilities;

    #[test]
    fn test_render() {
        let init = InitializeResult {
            protocol_version: "2025-06-18".to_string(),
            capabilities: Capabilities::new().with(Capability::Tools),
            server_info: Implementation::new("echo", "1.2.3"),
            instructions: Some("say hi".to_string()),
        };
        let text = render(&init, &["echo".to_string()]);
        assert!(text.contains("Server:       echo 1.2.3"));
        assert!(text.contains("Protocol:     2025-06-18"));
        assert!(text.contains("Capabilities: tools"));
        assert!(text.contains("Tools:        echo"));
        assert!(text.contains("Instructions: say hi"));
    }

    #[test]
    fn test_render_without_capabilities() {
        let init = InitializeResult {
            protocol_version: "2024-11-05".to_string(),
            capabilities: Capabilities::new(),
            server_info: Implementation::new("bare", "0"),
            instructions: None,
        };
        assert!(render(&init, &[]).contains("Capabilities: (none)"));
    }
}
