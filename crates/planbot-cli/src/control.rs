//! Control-plane client: approve/reject/respond against a running
//! `planbot serve` (or `start --serve`) instance, signing each body with
//! the shared secret.

use anyhow::{Context, Result, bail};

use crate::config::ConfigFile;
use crate::signature::{SIGNATURE_HEADER, sign};

fn base_url(operator: &ConfigFile) -> String {
    format!("http://127.0.0.1:{}", operator.webhook.port)
}

async fn post_signed(operator: &ConfigFile, path: &str, body: serde_json::Value) -> Result<()> {
    let url = format!("{}{path}", base_url(operator));
    let raw = serde_json::to_vec(&body)?;

    let client = reqwest::Client::new();
    let mut request = client
        .post(&url)
        .header("content-type", "application/json")
        .body(raw.clone());
    if let Some(secret) = operator.webhook_secret()? {
        request = request.header(SIGNATURE_HEADER, sign(&secret, &raw));
    }

    let response = request
        .send()
        .await
        .with_context(|| format!("failed to reach {url} -- is `planbot serve` running?"))?;
    if !response.status().is_success() {
        let status = response.status();
        let detail = response.text().await.unwrap_or_default();
        bail!("{path} returned {status}: {detail}");
    }
    Ok(())
}

pub async fn approve(operator: &ConfigFile, plan_id: &str) -> Result<()> {
    post_signed(
        operator,
        "/approve",
        serde_json::json!({
            "planId": plan_id,
            "approved": true,
            "respondedBy": "cli",
        }),
    )
    .await?;
    println!("Plan {plan_id} approved.");
    Ok(())
}

pub async fn reject(operator: &ConfigFile, plan_id: &str, reason: Option<&str>) -> Result<()> {
    post_signed(
        operator,
        "/approve",
        serde_json::json!({
            "planId": plan_id,
            "approved": false,
            "rejectionReason": reason,
            "respondedBy": "cli",
        }),
    )
    .await?;
    println!("Plan {plan_id} rejected.");
    Ok(())
}

pub async fn respond(operator: &ConfigFile, question_id: &str, answer: &str) -> Result<()> {
    post_signed(
        operator,
        "/respond",
        serde_json::json!({
            "questionId": question_id,
            "answer": answer,
            "respondedBy": "cli",
        }),
    )
    .await?;
    println!("Question {question_id} answered.");
    Ok(())
}
