// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{Alert, AlertLevel};
use reqwest::Url;
use serde_json::{json, Value};

/// Payload shape expected by a webhook sink, picked from its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookFormat {
    Slack,
    Discord,
    Generic,
}

impl WebhookFormat {
    pub fn for_url(url: &str) -> Self {
        let Ok(parsed) = Url::parse(url) else {
            return Self::Generic;
        };
        let host = parsed.host_str().unwrap_or_default().to_lowercase();
        if host == "hooks.slack.com" {
            return Self::Slack;
        }
        let discord_host = ["discord.com", "discordapp.com"]
            .iter()
            .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")));
        if discord_host && parsed.path().starts_with("/api/webhooks") {
            return Self::Discord;
        }
        Self::Generic
    }

    pub fn format(&self, alert: &Alert) -> Value {
        match self {
            Self::Slack => slack(alert),
            Self::Discord => discord(alert),
            Self::Generic => generic(alert),
        }
    }
}

fn emoji(level: AlertLevel) -> &'static str {
    match level {
        AlertLevel::Info => "ℹ️",
        AlertLevel::Warn => "⚠️",
        AlertLevel::Error => "🚨",
    }
}

fn slack(alert: &Alert) -> Value {
    let label = alert.level.as_str().to_uppercase();
    let mut context = format!(
        "*Level:* {label} | *Project:* {} | *Run:* {}",
        alert.project,
        alert.run.as_deref().unwrap_or("-"),
    );
    if let Some(step) = alert.step {
        context.push_str(&format!(" | *Step:* {step}"));
    }
    context.push_str(&format!(" | {}", alert.timestamp));

    let mut blocks = vec![json!({
        "type": "header",
        "text": {
            "type": "plain_text",
            "text": format!("{} {}", emoji(alert.level), alert.title),
        },
    })];
    if let Some(text) = alert.text.as_deref().filter(|t| !t.is_empty()) {
        blocks.push(json!({
            "type": "section",
            "text": {"type": "mrkdwn", "text": text},
        }));
    }
    blocks.push(json!({
        "type": "context",
        "elements": [{"type": "mrkdwn", "text": context}],
    }));

    json!({
        "text": format!("[{label}] {}", alert.title),
        "blocks": blocks,
    })
}

fn discord(alert: &Alert) -> Value {
    let color = match alert.level {
        AlertLevel::Info => 0x3498db,
        AlertLevel::Warn => 0xf1c40f,
        AlertLevel::Error => 0xe74c3c,
    };
    let mut fields = vec![
        json!({"name": "Level", "value": alert.level.as_str().to_uppercase(), "inline": true}),
        json!({"name": "Project", "value": alert.project, "inline": true}),
        json!({"name": "Run", "value": alert.run.as_deref().unwrap_or("-"), "inline": true}),
    ];
    if let Some(step) = alert.step {
        fields.push(json!({"name": "Step", "value": step.to_string(), "inline": true}));
    }
    let mut embed = json!({
        "title": format!("{} {}", emoji(alert.level), alert.title),
        "color": color,
        "fields": fields,
        "timestamp": alert.timestamp,
    });
    if let Some(text) = alert.text.as_deref().filter(|t| !t.is_empty()) {
        embed["description"] = json!(text);
    }
    json!({ "embeds": [embed] })
}

fn generic(alert: &Alert) -> Value {
    json!({
        "level": alert.level,
        "title": alert.title,
        "text": alert.text,
        "project": alert.project,
        "run": alert.run,
        "step": alert.step,
        "timestamp": alert.timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert() -> Alert {
        let mut alert = Alert::new(AlertLevel::Error, "Loss diverged", "mnist")
            .with_text("loss=inf")
            .with_run("brave-otter-1")
            .with_step(42);
        alert.timestamp = "2024-03-01T12:00:00Z".to_string();
        alert
    }

    #[test]
    fn test_format_selection() {
        let cases = [
            ("https://hooks.slack.com/services/T0/B0/xyz", WebhookFormat::Slack),
            ("https://discord.com/api/webhooks/1/abc", WebhookFormat::Discord),
            ("https://canary.discord.com/api/webhooks/1/abc", WebhookFormat::Discord),
            ("https://discordapp.com/api/webhooks/1/abc", WebhookFormat::Discord),
            ("https://discord.com/channels/1", WebhookFormat::Generic),
            ("https://notdiscord.com/api/webhooks/1", WebhookFormat::Generic),
            ("http://127.0.0.1:9000/hook", WebhookFormat::Generic),
            ("not a url", WebhookFormat::Generic),
        ];
        for (url, expected) in cases {
            assert_eq!(WebhookFormat::for_url(url), expected, "{url}");
        }
    }

    #[test]
    fn test_generic_carries_every_field() {
        let value = WebhookFormat::Generic.format(&alert());
        assert_eq!(
            value,
            json!({
                "level": "error",
                "title": "Loss diverged",
                "text": "loss=inf",
                "project": "mnist",
                "run": "brave-otter-1",
                "step": 42,
                "timestamp": "2024-03-01T12:00:00Z",
            })
        );
    }

    #[test]
    fn test_slack_blocks() {
        let value = WebhookFormat::Slack.format(&alert());
        assert_eq!(value["text"], "[ERROR] Loss diverged");
        let blocks = value["blocks"].as_array().unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[1]["text"]["text"], "loss=inf");
        let context = blocks[2]["elements"][0]["text"].as_str().unwrap();
        for needle in ["ERROR", "mnist", "brave-otter-1", "*Step:* 42", "2024-03-01T12:00:00Z"] {
            assert!(context.contains(needle), "{needle} missing from {context}");
        }
    }

    #[test]
    fn test_discord_embed() {
        let value = WebhookFormat::Discord.format(&alert());
        let embed = &value["embeds"][0];
        assert_eq!(embed["color"], 0xe74c3c);
        assert_eq!(embed["description"], "loss=inf");
        assert_eq!(embed["timestamp"], "2024-03-01T12:00:00Z");
        let names: Vec<&str> = embed["fields"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["Level", "Project", "Run", "Step"]);
    }

    #[test]
    fn test_discord_without_text_or_step() {
        let alert = Alert::new(AlertLevel::Info, "Started", "p");
        let value = WebhookFormat::Discord.format(&alert);
        assert!(value["embeds"][0].get("description").is_none());
        assert_eq!(value["embeds"][0]["fields"].as_array().unwrap().len(), 3);
    }
}
