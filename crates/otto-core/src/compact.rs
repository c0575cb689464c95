// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::rc::Rc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use otto_model::activity_names;
use otto_model::{CompactInput, CompactOutput, ItemPayload};
use otto_workflow::{ActivityError, ActivityOptions, RetryPolicy};

use crate::control::Phase;
use crate::session::SessionShared;

/// LLM-driven history compaction.
///
/// Model-switch items are held out of the summarization input and the most
/// recent one is re-appended afterwards, so the active model stays aware of
/// the transition.  On success the response-chain state is cleared, forcing
/// a full history send on the next LLM call.  Failures return to the caller,
/// which may fall back to a destructive drop.
pub(crate) async fn run_compaction(sh: &Rc<SessionShared>) -> Result<(), ActivityError> {
    let (input, last_switch) = {
        let st = sh.state.borrow();
        let mut switches = Vec::new();
        let mut others = Vec::new();
        for item in st.history.items() {
            if matches!(item.payload, ItemPayload::ModelSwitch { .. }) {
                switches.push(item.clone());
            } else {
                others.push(item.clone());
            }
        }
        let input = CompactInput {
            model: st.resolved_profile.clone(),
            input: others,
            instructions: st.config.base_instructions.clone(),
        };
        (input, switches.pop())
    };

    sh.set_phase(Phase::Compacting);
    let options = ActivityOptions::default()
        .with_retry(RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        })
        .with_start_to_close(Duration::from_secs(180));
    let result = sh
        .ctx
        .execute_activity(
            activity_names::EXECUTE_COMPACT,
            serde_json::to_value(&input).unwrap_or(Value::Null),
            options,
        )
        .await?;
    let output: CompactOutput = serde_json::from_value(result)
        .map_err(|e| ActivityError::application(format!("malformed compact result: {e}")))?;

    {
        let mut st = sh.state.borrow_mut();
        let before = st.history.len();
        st.history.replace_all(&output.items);
        if let Some(mut switch) = last_switch {
            switch.turn_id = None;
            st.history.append(switch);
        }
        st.compaction_count += 1;
        st.last_response_id = None;
        st.last_sent_history_len = 0;
        st.total_tokens += output.token_usage.total;
        st.total_cached_tokens += output.token_usage.cached;
        debug!(
            before,
            after = st.history.len(),
            compactions = st.compaction_count,
            "history compacted"
        );
    }
    sh.control.borrow_mut().compacted_this_turn = true;
    sh.bump();
    Ok(())
}
