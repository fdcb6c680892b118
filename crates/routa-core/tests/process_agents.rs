//! Process-backed providers driven end to end against scripted `sh` agents
#![cfg(unix)]

mod common;

use common::{text_of, until_turn_complete};
use futures::StreamExt;
use pretty_assertions::assert_eq;
use routa_core::error::ProviderError;
use routa_core::provider::{ProviderDescriptor, ProviderProtocol};
use routa_core::{
    CoreConfig, EnvelopeKind, Error, NewSessionOptions, NotificationEnvelope, SessionService,
    StopReason, Storage,
};
use std::sync::Arc;
use std::time::Duration;

/// ACP agent: answers the handshake, streams two chunks per prompt, holds a
/// "wait" prompt open until `session/cancel`, and floods on "flood".
const ACP_AGENT: &str = r#"
chunk() {
  printf '{"jsonrpc":"2.0","method":"session/update","params":{"sessionId":"agent-1","update":{"sessionUpdate":"agent_message_chunk","content":{"type":"text","text":"%s"}}}}\n' "$1"
}
pending=""
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9]*\),.*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":1,"agentInfo":{"name":"fake-agent","version":"0.1.0"}}}\n' "$id" ;;
    *'"method":"session/new"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"sessionId":"agent-1"}}\n' "$id" ;;
    *'"method":"session/cancel"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"stopReason":"cancelled"}}\n' "$pending" ;;
    *'"method":"session/prompt"'*'"text":"wait"'*)
      pending=$id
      chunk "Working" ;;
    *'"method":"session/prompt"'*'"text":"flood"'*)
      i=0
      while [ $i -lt 300 ]; do chunk "$i"; i=$((i+1)); done
      printf '{"jsonrpc":"2.0","id":%s,"result":{"stopReason":"end_turn"}}\n' "$id" ;;
    *'"method":"session/prompt"'*)
      chunk "Hi"
      chunk " there"
      printf '{"jsonrpc":"2.0","id":%s,"result":{"stopReason":"end_turn","usage":{"inputTokens":5,"outputTokens":2}}}\n' "$id" ;;
  esac
done
"#;

/// Streamed-JSON CLI: a tool round trip per prompt; "wait" stays open until
/// an interrupt, which ends the turn with an error result.
const STREAM_JSON_CLI: &str = r#"
while IFS= read -r line; do
  rid=$(printf '%s\n' "$line" | sed -n 's/.*"request_id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"subtype":"initialize"'*)
      printf '{"type":"system","subtype":"init","session_id":"cli-1"}\n'
      printf '{"type":"control_response","response":{"subtype":"success","request_id":"%s"}}\n' "$rid" ;;
    *'"subtype":"interrupt"'*)
      printf '{"type":"control_response","response":{"subtype":"success","request_id":"%s"}}\n' "$rid"
      printf '{"type":"assistant","message":{"content":[{"type":"text","text":"late"}]}}\n'
      printf '{"type":"result","subtype":"error_during_execution","is_error":true,"session_id":"cli-1"}\n' ;;
    *'"text":"wait"'*)
      printf '{"type":"assistant","message":{"content":[{"type":"text","text":"Working"}]}}\n' ;;
    *'"type":"user"'*)
      printf '{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"look first"},{"type":"text","text":"Hi"},{"type":"tool_use","id":"tu1","name":"Bash","input":{"command":"ls"}}]}}\n'
      printf '{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"tu1","content":"a.rs","is_error":false}]}}\n'
      printf '{"type":"result","subtype":"success","is_error":false,"session_id":"cli-1","usage":{"input_tokens":10,"output_tokens":4}}\n' ;;
  esac
done
"#;

fn scripted(id: &str, protocol: ProviderProtocol, script: &str) -> ProviderDescriptor {
    ProviderDescriptor {
        protocol,
        ..ProviderDescriptor::custom_acp(
            id,
            "Scripted agent",
            "sh",
            vec!["-c".to_string(), script.to_string()],
        )
    }
}

/// A service whose `opencode` and `claude` entries run the scripts above
fn service() -> Arc<SessionService> {
    let service = SessionService::new(
        CoreConfig::default(),
        Arc::new(Storage::in_memory().unwrap()),
    );
    service
        .registry()
        .register(scripted("opencode", ProviderProtocol::Acp, ACP_AGENT));
    service
        .registry()
        .register(scripted("claude", ProviderProtocol::StreamJson, STREAM_JSON_CLI));
    Arc::new(service)
}

async fn session(service: &SessionService, provider: &str) -> String {
    service
        .new_session(NewSessionOptions::new(provider, "/tmp"))
        .await
        .unwrap()
        .session_id
}

fn kinds(envelopes: &[NotificationEnvelope]) -> Vec<EnvelopeKind> {
    envelopes.iter().map(NotificationEnvelope::kind).collect()
}

#[tokio::test]
async fn test_acp_prompt_streams_chunks_then_one_turn_complete() {
    let service = service();
    let sid = session(&service, "opencode").await;
    assert!(service.is_live(&sid));
    assert_eq!(
        service.get_session(&sid).unwrap().provider_session_id.as_deref(),
        Some("agent-1")
    );

    let mut sub = service.attach(&sid);
    let response = service.prompt(&sid, "hello", None, None).await.unwrap();
    assert_eq!(response.stop_reason, StopReason::EndTurn);
    let usage = response.usage.unwrap();
    assert_eq!((usage.input_tokens, usage.output_tokens), (5, 2));

    let seen = until_turn_complete(&mut sub).await;
    assert_eq!(
        kinds(&seen),
        vec![
            EnvelopeKind::Connected,
            EnvelopeKind::MessageChunk,
            EnvelopeKind::MessageChunk,
            EnvelopeKind::TurnComplete,
        ]
    );
    let text: String = seen.iter().filter_map(text_of).collect();
    assert_eq!(text, "Hi there");

    // Nothing trails the terminal frame.
    let trailing = tokio::time::timeout(Duration::from_millis(100), sub.receiver.recv()).await;
    assert!(trailing.is_err());
}

#[tokio::test]
async fn test_acp_cancel_ends_turn_as_cancelled() {
    let service = service();
    let sid = session(&service, "opencode").await;
    let mut sub = service.attach(&sid);

    let stream = service.start_turn(&sid, "wait", None, None).await.unwrap();
    let turn = service.spawn_turn(&sid, stream, None);

    assert_eq!(sub.receiver.recv().await.unwrap().kind(), EnvelopeKind::Connected);
    let first = tokio::time::timeout(Duration::from_secs(2), sub.receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(text_of(&first), Some("Working"));

    service.cancel(&sid).await.unwrap();
    service.cancel(&sid).await.unwrap();
    let response = tokio::time::timeout(Duration::from_secs(2), turn)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.stop_reason, StopReason::Cancelled);
    assert_eq!(kinds(&until_turn_complete(&mut sub).await), vec![EnvelopeKind::TurnComplete]);

    // The agent is still usable afterwards.
    let again = service.prompt(&sid, "hello", None, None).await.unwrap();
    assert_eq!(again.stop_reason, StopReason::EndTurn);
}

#[tokio::test]
async fn test_acp_updates_lost_to_lag_are_reported() {
    let service = service();
    let sid = session(&service, "opencode").await;

    // Nobody polls the stream while the agent floods the channel.
    let stream = service.start_turn(&sid, "flood", None, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let items: Vec<_> = stream.collect().await;
    let envelopes: Vec<_> = items.into_iter().map(Result::unwrap).collect();
    let errors = envelopes
        .iter()
        .filter(|e| e.kind() == EnvelopeKind::Error)
        .count();
    let chunks = envelopes
        .iter()
        .filter(|e| e.kind() == EnvelopeKind::MessageChunk)
        .count();
    assert_eq!(errors, 1);
    assert!(chunks > 0 && chunks < 300, "{} chunks survived", chunks);
    assert_eq!(
        envelopes.last().map(NotificationEnvelope::kind),
        Some(EnvelopeKind::TurnComplete)
    );
}

#[tokio::test]
async fn test_killed_acp_process_is_not_recreated() {
    let service = service();
    let sid = session(&service, "opencode").await;

    assert!(service.kill(&sid).await);
    assert!(!service.is_live(&sid));

    let Err(err) = service.prompt(&sid, "hello", None, None).await else {
        panic!("a killed agent process accepted a prompt");
    };
    assert!(matches!(
        err,
        Error::Provider(ProviderError::ProcessNotRunning(_))
    ));
}

#[tokio::test]
async fn test_stream_json_turn_renders_tool_round_trip() {
    let service = service();
    let sid = session(&service, "claude").await;
    assert_eq!(
        service.get_session(&sid).unwrap().provider_session_id.as_deref(),
        Some("cli-1")
    );

    let mut sub = service.attach(&sid);
    let response = service.prompt(&sid, "list files", None, None).await.unwrap();
    assert_eq!(response.stop_reason, StopReason::EndTurn);
    let usage = response.usage.unwrap();
    assert_eq!((usage.input_tokens, usage.output_tokens), (10, 4));

    let seen = until_turn_complete(&mut sub).await;
    assert_eq!(
        kinds(&seen),
        vec![
            EnvelopeKind::Connected,
            EnvelopeKind::ThoughtChunk,
            EnvelopeKind::MessageChunk,
            EnvelopeKind::ToolCallUpdate,
            EnvelopeKind::TurnComplete,
        ]
    );
}

#[tokio::test]
async fn test_stream_json_interrupt_swallows_rest_of_turn() {
    let service = service();
    let sid = session(&service, "claude").await;
    let mut sub = service.attach(&sid);

    let stream = service.start_turn(&sid, "wait", None, None).await.unwrap();
    let turn = service.spawn_turn(&sid, stream, None);

    assert_eq!(sub.receiver.recv().await.unwrap().kind(), EnvelopeKind::Connected);
    let first = tokio::time::timeout(Duration::from_secs(2), sub.receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(text_of(&first), Some("Working"));

    service.cancel(&sid).await.unwrap();
    let response = tokio::time::timeout(Duration::from_secs(2), turn)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.stop_reason, StopReason::Cancelled);
    assert_eq!(kinds(&until_turn_complete(&mut sub).await), vec![EnvelopeKind::TurnComplete]);

    // The interrupted turn's tail does not leak into the next one.
    let response = service.prompt(&sid, "again", None, None).await.unwrap();
    assert_eq!(response.stop_reason, StopReason::EndTurn);
    let next = until_turn_complete(&mut sub).await;
    let text: String = next.iter().filter_map(text_of).collect();
    assert_eq!(text, "Hi");
}
