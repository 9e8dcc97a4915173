//! Overview commands: registry listing, task monitor board, KPI window, and
//! active-project switching.

use crate::app::{Gateway, Turn};
use crate::error::GatewayError;
use crate::kpi::summarize_gateway_metrics;
use crate::render::{summarize_orch_registry, summarize_task_monitor};
use crate::resolver::{Cmd, ResolvedCommand};
use crate::store::ManagerState;

pub async fn handle_orch_overview_command(
    gw: &mut Gateway,
    turn: &mut Turn,
    state: &mut ManagerState,
    resolved: &ResolvedCommand,
) -> Result<bool, GatewayError> {
    match &resolved.cmd {
        Cmd::OrchList => {
            let body = summarize_orch_registry(state);
            gw.send(turn, &body, "orch-list", false).await;
            Ok(true)
        }

        Cmd::OrchMonitor => {
            let (key, _paths) = gw.get_context(turn, state, resolved.orch_target.as_deref())?;
            let limit = resolved.orch_monitor_limit.unwrap_or(12).clamp(1, 50) as usize;

            let recent_refs = {
                let entry = state.project_mut(&key).expect("resolved project");
                entry.backfill_task_aliases();
                entry.latest_task_request_refs(limit)
            };
            state.set_recent_task_refs(&turn.chat_id, &key, &recent_refs);
            let current_sel = state.selected_task_ref(&turn.chat_id, &key);
            if current_sel.is_empty() {
                if let Some(first) = recent_refs.first() {
                    state.set_selected_task_ref(&turn.chat_id, &key, first);
                }
            }
            gw.persist(state);

            let body = {
                let entry = state.project(&key).expect("resolved project");
                summarize_task_monitor(&key, entry, limit)
            };
            gw.send(turn, &body, "orch-monitor", true).await;
            Ok(true)
        }

        Cmd::OrchKpi => {
            let (key, paths) = gw.get_context(turn, state, resolved.orch_target.as_deref())?;
            let hours = resolved.orch_kpi_hours.unwrap_or(24).clamp(1, 168);
            let body = summarize_gateway_metrics(&paths.team_dir, &key, hours);
            gw.send(turn, &body, "orch-kpi", true).await;
            Ok(true)
        }

        Cmd::OrchUse => {
            let Some(target) = resolved.orch_target.as_deref().filter(|t| !t.trim().is_empty()) else {
                gw.send(turn, "usage: aoe orch use <name>", "orch-use usage", false).await;
                return Ok(true);
            };
            let key = state.project_key(Some(target))?;
            state.active = key.clone();
            gw.persist(state);
            gw.send(turn, &format!("active orch changed: {}", key), "orch-use", false).await;
            Ok(true)
        }

        _ => Ok(false),
    }
}
