//! OpenAI 互換のチャット補完 API を使うメッセージ生成とサポートチャット。

use std::collections::VecDeque;
use std::fmt::Display;

use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use zapflow_common::sse::{self, SseLine};
use zapflow_common::template::NAME_PLACEHOLDER;

use crate::config::AppConfig;
use crate::error::AppError;

pub const MAX_VARIATIONS: usize = 10;

const VARIATIONS_PROMPT: &str = "Você reescreve mensagens de marketing para WhatsApp. \
Gere versões diferentes da mensagem do usuário mantendo o sentido, o tom e o idioma. \
Preserve exatamente o marcador {nome} quando ele aparecer. \
Responda somente com um array JSON de strings.";

const SUPPORT_PROMPT: &str = "Você é o assistente de suporte do Zapflow, uma plataforma de \
envio de campanhas pelo WhatsApp. Responda de forma curta e objetiva em português.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    fn system(content: &str) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

pub struct AiClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl AiClient {
    /// API キーが設定されていなければ `None`
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        Some(Self {
            client: reqwest::Client::new(),
            api_url: config.ai_api_url.clone(),
            api_key: config.ai_api_key.clone()?,
            model: config.ai_model.clone(),
        })
    }

    async fn send(&self, messages: &[ChatMessage], stream: bool) -> Result<reqwest::Response, AppError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
        });
        let resp = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::BadGateway(format!("AI request failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            tracing::warn!(%status, body = %text, "AI provider returned an error");
            return Err(AppError::BadGateway(format!("AI provider returned {status}")));
        }
        Ok(resp)
    }

    pub async fn variations(&self, message: &str, count: usize) -> Result<Vec<String>, AppError> {
        let prompt = format!("Quantidade: {count}\nMensagem:\n{message}");
        let messages = [ChatMessage::system(VARIATIONS_PROMPT), ChatMessage::user(prompt)];
        let value: serde_json::Value = self
            .send(&messages, false)
            .await?
            .json()
            .await
            .map_err(|e| AppError::BadGateway(format!("invalid AI response: {e}")))?;
        let content = value["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| AppError::BadGateway("AI response has no content".into()))?;
        parse_variations(content, count, message.contains(NAME_PLACEHOLDER))
    }

    /// サポートチャット。上流の SSE を本文の差分列に変換して返す。
    pub async fn stream_chat(
        &self,
        history: Vec<ChatMessage>,
    ) -> Result<BoxStream<'static, String>, AppError> {
        let mut messages = vec![ChatMessage::system(SUPPORT_PROMPT)];
        messages.extend(history.into_iter().filter(|m| m.role != "system"));
        let resp = self.send(&messages, true).await?;
        Ok(deltas(Box::pin(resp.bytes_stream())).boxed())
    }
}

/// 応答本文をバリエーションの列にする。JSON 配列でなければ行ごとに分割する。
pub fn parse_variations(
    content: &str,
    count: usize,
    require_placeholder: bool,
) -> Result<Vec<String>, AppError> {
    let body = content.trim();
    let body = body
        .strip_prefix("```json")
        .or_else(|| body.strip_prefix("```"))
        .unwrap_or(body);
    let body = body.strip_suffix("```").unwrap_or(body).trim();

    let candidates: Vec<String> = match serde_json::from_str::<Vec<String>>(body) {
        Ok(list) => list,
        Err(_) => body.lines().map(clean_line).collect(),
    };

    let mut variations: Vec<String> = Vec::new();
    for candidate in candidates {
        let candidate = candidate.trim().to_string();
        if candidate.is_empty()
            || (require_placeholder && !candidate.contains(NAME_PLACEHOLDER))
            || variations.contains(&candidate)
        {
            continue;
        }
        variations.push(candidate);
    }
    variations.truncate(count);
    if variations.is_empty() {
        return Err(AppError::BadGateway(
            "AI returned no usable variations".into(),
        ));
    }
    Ok(variations)
}

/// `1. `, `2) `, `- ` などの番号・箇条書きと囲みの引用符を外す
fn clean_line(line: &str) -> String {
    let line = line.trim();
    let line = line.trim_start_matches(|c: char| c.is_ascii_digit());
    let line = line
        .strip_prefix('.')
        .or_else(|| line.strip_prefix(')'))
        .unwrap_or(line);
    let line = line.trim_start_matches(['-', '*', '•']).trim();
    line.trim_matches('"').trim().to_string()
}

struct DeltaState<S> {
    upstream: S,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    done: bool,
}

impl<S> DeltaState<S> {
    fn feed_line(&mut self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        match sse::parse_line(line.trim_end_matches('\r')) {
            SseLine::Delta(text) => self.pending.push_back(text),
            SseLine::Done => self.done = true,
            SseLine::Ignored => {}
        }
    }

    fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        while !self.done
            && let Some(pos) = self.buffer.iter().position(|b| *b == b'\n')
        {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.feed_line(&line[..line.len() - 1]);
        }
    }

    fn finish(&mut self) {
        if !self.done && !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            self.feed_line(&rest);
        }
        self.done = true;
    }
}

/// 行単位で SSE を読み、`choices[0].delta.content` だけを流す。
/// 行がチャンクの境界で分かれていてもよい。
pub(crate) fn deltas<S, B, E>(upstream: S) -> impl Stream<Item = String> + Send + 'static
where
    S: Stream<Item = Result<B, E>> + Unpin + Send + 'static,
    B: AsRef<[u8]>,
    E: Display,
{
    let state = DeltaState {
        upstream,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        done: false,
    };
    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(delta) = state.pending.pop_front() {
                return Some((delta, state));
            }
            if state.done {
                return None;
            }
            match state.upstream.next().await {
                Some(Ok(chunk)) => state.feed(chunk.as_ref()),
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "AI stream interrupted");
                    state.done = true;
                }
                None => state.finish(),
            }
        }
    })
}
