//! Capabilities the reasoning backend may invoke.
//!
//! The registry is a closed enum: every capability, its schema and the
//! minimum role allowed to trigger it live in one table, and dispatch is
//! an exhaustive match.

use crate::audit::AuditLog;
use crate::channel::ChannelHandle;
use crate::evolution::{EvolutionPipeline, EvolutionProposal};
use crate::runtime::exit::ExitController;
use crate::types::{AuditOutcome, AuthInfo, ExitSignal, RoleLevel, ToolCall, ToolResult};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Definition of a tool exposed to the reasoning backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    EvolveCode,
    RequestHotReload,
    IsolateSelf,
    ReportProgress,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::EvolveCode,
        Capability::RequestHotReload,
        Capability::IsolateSelf,
        Capability::ReportProgress,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::EvolveCode => "evolve_code",
            Self::RequestHotReload => "request_hot_reload",
            Self::IsolateSelf => "isolate_self",
            Self::ReportProgress => "report_progress",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    pub fn min_role(self) -> RoleLevel {
        match self {
            Self::EvolveCode | Self::RequestHotReload | Self::IsolateSelf => RoleLevel::Root,
            Self::ReportProgress => RoleLevel::Admin,
        }
    }

    pub fn definition(self) -> ToolDefinition {
        let (description, parameters) = match self {
            Self::EvolveCode => (
                "Overwrite one file in the agent workspace and commit it. \
                 The system prompt lives at prompts/system.md. \
                 Takes effect only after request_hot_reload.",
                json!({
                    "type": "object",
                    "properties": {
                        "path": {
                            "type": "string",
                            "description": "Path relative to the workspace root"
                        },
                        "content": {
                            "type": "string",
                            "description": "Complete new file content"
                        },
                        "reason": {
                            "type": "string",
                            "description": "Why the change is needed"
                        }
                    },
                    "required": ["path", "content", "reason"]
                }),
            ),
            Self::RequestHotReload => (
                "Restart the agent so committed changes take effect.",
                json!({
                    "type": "object",
                    "properties": {
                        "reason": {
                            "type": "string",
                            "description": "Summary reported after the restart"
                        }
                    },
                    "required": ["reason"]
                }),
            ),
            Self::IsolateSelf => (
                "Shut the agent down permanently. Use only when continuing would be unsafe.",
                json!({
                    "type": "object",
                    "properties": {
                        "reason": {
                            "type": "string",
                            "description": "Why the agent is isolating itself"
                        }
                    },
                    "required": ["reason"]
                }),
            ),
            Self::ReportProgress => (
                "Send a short progress message to the current conversation.",
                json!({
                    "type": "object",
                    "properties": {
                        "message": {
                            "type": "string",
                            "description": "Progress text"
                        }
                    },
                    "required": ["message"]
                }),
            ),
        };
        ToolDefinition {
            name: self.name().into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Tool definitions a caller with `role` is allowed to see.
pub fn definitions_for(role: RoleLevel) -> Vec<ToolDefinition> {
    Capability::ALL
        .into_iter()
        .filter(|c| role >= c.min_role())
        .map(Capability::definition)
        .collect()
}

// ---------------------------------------------------------------------------
// Tool execution engine
// ---------------------------------------------------------------------------

/// Subsystem handles available to tool execution.
#[derive(Clone)]
pub struct ToolContext {
    pub evolution: Arc<EvolutionPipeline>,
    pub exit: ExitController,
    pub channel: ChannelHandle,
    pub audit: AuditLog,
    pub signature: String,
}

/// Execute one tool call on behalf of `caller`, replying into `reply_target`.
pub async fn execute_tool(
    ctx: &ToolContext,
    caller: &AuthInfo,
    reply_target: &str,
    call: &ToolCall,
) -> ToolResult {
    let result = match Capability::from_name(&call.name) {
        None => Err(anyhow!("Unknown tool: {}", call.name)),
        Some(cap) if caller.role < cap.min_role() => {
            warn!(sender = %caller.identity, tool = cap.name(), "Tool call denied");
            ctx.audit
                .record(
                    &caller.identity,
                    cap.name(),
                    Some("insufficient role"),
                    AuditOutcome::Denied,
                )
                .await;
            Err(anyhow!("Access denied: {} requires {}", cap.name(), cap.min_role()))
        }
        Some(Capability::EvolveCode) => evolve_code(ctx, caller, reply_target, &call.arguments).await,
        Some(Capability::RequestHotReload) => {
            request_hot_reload(ctx, caller, reply_target, &call.arguments).await
        }
        Some(Capability::IsolateSelf) => isolate_self(ctx, caller, &call.arguments).await,
        Some(Capability::ReportProgress) => {
            report_progress(ctx, reply_target, &call.arguments).await
        }
    };

    match result {
        Ok(output) => ToolResult {
            tool_call_id: call.id.clone(),
            output,
            success: true,
        },
        Err(e) => ToolResult {
            tool_call_id: call.id.clone(),
            output: format!("Error: {}", e),
            success: false,
        },
    }
}

fn str_arg<'a>(args: &'a serde_json::Value, key: &str) -> Result<&'a str> {
    args[key]
        .as_str()
        .ok_or_else(|| anyhow!("Missing '{}' argument", key))
}

async fn evolve_code(
    ctx: &ToolContext,
    caller: &AuthInfo,
    reply_target: &str,
    args: &serde_json::Value,
) -> Result<String> {
    let proposal = EvolutionProposal {
        path: str_arg(args, "path")?.to_string(),
        content: str_arg(args, "content")?.to_string(),
        reason: str_arg(args, "reason")?.to_string(),
    };
    let record = ctx
        .evolution
        .propose(&proposal, &caller.identity, Some(reply_target.to_string()))
        .await?;
    Ok(match record.commit_id {
        Some(id) => format!(
            "Committed {} as {}. Call request_hot_reload to apply it.",
            record.target_path, id
        ),
        None => format!("{} already had that content; nothing committed.", record.target_path),
    })
}

async fn request_hot_reload(
    ctx: &ToolContext,
    caller: &AuthInfo,
    reply_target: &str,
    args: &serde_json::Value,
) -> Result<String> {
    let reason = str_arg(args, "reason")?;
    ctx.evolution
        .request_reload(reason, Some(reply_target.to_string()), &caller.identity)
        .await?;
    info!("Hot reload requested: {}", reason);
    ctx.exit.request(ExitSignal::HotReload);
    Ok("Restarting to apply changes.".into())
}

async fn isolate_self(
    ctx: &ToolContext,
    caller: &AuthInfo,
    args: &serde_json::Value,
) -> Result<String> {
    let reason = str_arg(args, "reason")?;
    ctx.audit
        .record(&caller.identity, "isolate_self", Some(reason), AuditOutcome::Success)
        .await;
    warn!("Self-isolation requested: {}", reason);
    ctx.exit.request(ExitSignal::SelfIsolate);
    Ok("Isolating. The supervisor will not restart this process.".into())
}

async fn report_progress(
    ctx: &ToolContext,
    reply_target: &str,
    args: &serde_json::Value,
) -> Result<String> {
    let message = str_arg(args, "message")?;
    let text = format!("{}{}", message, ctx.signature);
    ctx.channel.send_text(reply_target, &text).await?;
    Ok("Progress sent.".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_names_round_trip() {
        for cap in Capability::ALL {
            assert_eq!(Capability::from_name(cap.name()), Some(cap));
            assert_eq!(cap.definition().name, cap.name());
        }
        assert_eq!(Capability::from_name("exec"), None);
    }

    #[test]
    fn definitions_are_filtered_by_role() {
        assert!(definitions_for(RoleLevel::Guest).is_empty());
        let admin: Vec<String> = definitions_for(RoleLevel::Admin)
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(admin, vec!["report_progress".to_string()]);
        assert_eq!(definitions_for(RoleLevel::Root).len(), 4);
    }
}
