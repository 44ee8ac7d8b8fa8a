/*
 * Council Analyzer CLI - Ollama Chat Endpoint
 * Copyright (c) 2025 Council Analyzer Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;

use crate::capabilities::{Chat, ChatOptions};

/// Non-streaming client for a local Ollama endpoint. The pipeline issues
/// one request at a time; the service is treated as a serial singleton.
pub struct OllamaClient {
    client: Client,
    base_url: String,
    request_timeout: Duration,
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: i32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    done: bool,
}

impl OllamaClient {
    pub fn new(base_url: &str, timeout_sec: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_sec.max(1)))
            .build()
            .context("Failed to create HTTP client for Ollama")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(timeout_sec.max(1)),
        })
    }

    /// Check that the Ollama service is up and reachable.
    pub async fn health_check(&self) -> Result<()> {
        let response = timeout(
            Duration::from_secs(5),
            self.client.get(format!("{}/api/tags", self.base_url)).send(),
        )
        .await
        .context("Ollama service timeout")?
        .context("Failed to connect to Ollama service")?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Ollama service returned status: {}",
                response.status()
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Chat for OllamaClient {
    async fn generate(&self, model: &str, prompt: &str, options: ChatOptions) -> Result<String> {
        let request = GenerateRequest {
            model: model.to_string(),
            prompt: prompt.to_string(),
            stream: false,
            options: GenerateOptions {
                temperature: options.temperature,
                num_predict: options.max_tokens,
            },
        };

        let response = timeout(
            self.request_timeout,
            self.client
                .post(format!("{}/api/generate", self.base_url))
                .json(&request)
                .send(),
        )
        .await
        .context("Ollama generate timeout")?
        .context("Failed to send request to Ollama")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_else(|_| "<no body>".to_string());
            return Err(anyhow::anyhow!("Ollama API error ({}): {}", status, body));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .context("Failed to parse Ollama response")?;

        if !parsed.done {
            tracing::warn!("Ollama returned a non-final response in non-streaming mode");
        }

        Ok(parsed.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generate_posts_to_the_generate_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/generate")
            .match_header("content-type", "application/json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"response": "{\"score\": 90, \"issues\": []}", "done": true}"#)
            .create_async()
            .await;

        let client = OllamaClient::new(&server.url(), 10).unwrap();
        let response = client
            .generate(
                "mistral:7b-instruct",
                "Check this transcript segment",
                ChatOptions { temperature: 0.2, max_tokens: 500 },
            )
            .await
            .unwrap();

        assert!(response.contains("\"score\": 90"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn generate_surfaces_api_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/generate")
            .with_status(500)
            .with_body("model not loaded")
            .create_async()
            .await;

        let client = OllamaClient::new(&server.url(), 10).unwrap();
        let err = client
            .generate("mistral:7b-instruct", "prompt", ChatOptions::default())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Ollama API error"));
    }

    #[tokio::test]
    async fn health_check_requires_success_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/tags")
            .with_status(200)
            .with_body(r#"{"models": []}"#)
            .create_async()
            .await;

        let client = OllamaClient::new(&server.url(), 10).unwrap();
        assert!(client.health_check().await.is_ok());
    }
}
