//! Table-driven state machine core.
//!
//! Both the client and stream control planes are static tables of
//! `(state, accept mask, next, execute, retry budget)`. States are bit
//! values so accept masks are plain bit sets and transition checks are
//! O(1). The `next` selector picks a successor from context; `execute`
//! performs the state's action and may step the machine again (the table
//! functions recurse on the same context).

use crate::error::{ServiceCallResult, StreamError, StreamResult};
use crate::protocol_constants::SERVICE_CALL_RETRY_DELAY_BASE;
use crate::time::Ticks;

/// One state row.
pub struct StateSpec<C> {
    /// Bit value of this state.
    pub state: u32,
    /// Bit set of states allowed to transition here.
    pub accept: u32,
    /// Chooses the successor state. May adjust context (the stopped-state
    /// selector re-arms recovery flags) and may fail when no recovery is
    /// possible.
    pub next: fn(&mut C) -> StreamResult<u32>,
    /// Runs the state's action. `call_after` is the earliest wall-clock
    /// time an emitted service call should be issued at (retry backoff).
    pub execute: fn(&mut C, Ticks) -> StreamResult<()>,
    /// Consecutive self-transitions allowed before the machine surfaces
    /// this state's failure. `None` retries forever.
    pub retry_limit: Option<u32>,
    /// Human-readable state name for logs and failure errors.
    pub name: &'static str,
}

/// Mutable position of a machine instance.
#[derive(Debug, Clone)]
pub struct MachineCore {
    current: usize,
    retry_count: u32,
}

impl MachineCore {
    /// Starts at the first table row.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: 0,
            retry_count: 0,
        }
    }

    /// Bit value of the current state.
    #[must_use]
    pub fn state<C>(&self, table: &[StateSpec<C>]) -> u32 {
        table[self.current].state
    }

    /// Whether the current state is within `mask`.
    #[must_use]
    pub fn accepts<C>(&self, table: &[StateSpec<C>], mask: u32) -> bool {
        self.state(table) & mask != 0
    }

    /// Resets to the first table row.
    pub fn reset(&mut self) {
        self.current = 0;
        self.retry_count = 0;
    }
}

impl Default for MachineCore {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential retry backoff for control-plane self-transitions.
#[must_use]
pub fn retry_delay(retry_count: u32) -> Ticks {
    (1u64 << retry_count.min(16)) * SERVICE_CALL_RETRY_DELAY_BASE
}

/// Advances the machine one step.
///
/// `core_of` projects the machine position out of the context and
/// `last_result_of` reads the last reported service-call result (used in
/// the failure error when a state exhausts its retry budget).
pub fn step<C>(
    table: &'static [StateSpec<C>],
    core_of: fn(&mut C) -> &mut MachineCore,
    last_result_of: fn(&C) -> ServiceCallResult,
    label: &'static str,
    ctx: &mut C,
    now: Ticks,
) -> StreamResult<()> {
    let current_index = core_of(ctx).current;
    let current_state = table[current_index].state;
    let last_result = last_result_of(ctx);

    let next_state = (table[current_index].next)(ctx)?;
    let next_index = table
        .iter()
        .position(|s| s.state == next_state)
        .ok_or_else(|| StreamError::Internal(format!("unknown state 0x{next_state:x}")))?;

    log::debug!(
        "[{label}] {} -> {}",
        table[current_index].name,
        table[next_index].name
    );

    if table[next_index].accept & current_state != current_state {
        return Err(StreamError::InvalidStreamState);
    }

    let call_after;
    {
        let core = core_of(ctx);
        if next_index != current_index {
            core.retry_count = 0;
            call_after = now;
        } else {
            core.retry_count += 1;
            call_after = now + retry_delay(core.retry_count);
            if let Some(limit) = table[next_index].retry_limit {
                if core.retry_count > limit {
                    return Err(StreamError::ServiceCallFailed {
                        state: table[next_index].name,
                        result: last_result,
                    });
                }
            }
        }
        core.current = next_index;
    }

    (table[next_index].execute)(ctx, call_after)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ctx {
        core: MachineCore,
        go: bool,
        executed: Vec<&'static str>,
    }

    const A: u32 = 1 << 0;
    const B: u32 = 1 << 1;

    fn from_a(ctx: &mut Ctx) -> StreamResult<u32> {
        Ok(if ctx.go { B } else { A })
    }

    fn exec_a(ctx: &mut Ctx, _t: Ticks) -> StreamResult<()> {
        ctx.executed.push("a");
        Ok(())
    }

    fn exec_b(ctx: &mut Ctx, _t: Ticks) -> StreamResult<()> {
        ctx.executed.push("b");
        Ok(())
    }

    static TABLE: &[StateSpec<Ctx>] = &[
        StateSpec {
            state: A,
            accept: A,
            next: from_a,
            execute: exec_a,
            retry_limit: Some(2),
            name: "a",
        },
        StateSpec {
            state: B,
            accept: A | B,
            next: |_| Ok(B),
            execute: exec_b,
            retry_limit: None,
            name: "b",
        },
    ];

    fn step_ctx(ctx: &mut Ctx) -> StreamResult<()> {
        step(
            TABLE,
            |c| &mut c.core,
            |_| ServiceCallResult::Unknown,
            "Test",
            ctx,
            0,
        )
    }

    #[test]
    fn transitions_follow_selectors_and_accept_masks() {
        let mut ctx = Ctx {
            core: MachineCore::new(),
            go: true,
            executed: Vec::new(),
        };
        step_ctx(&mut ctx).unwrap();
        assert_eq!(ctx.core.state(TABLE), B);
        assert_eq!(ctx.executed, vec!["b"]);
    }

    #[test]
    fn retry_budget_surfaces_failure() {
        let mut ctx = Ctx {
            core: MachineCore::new(),
            go: false,
            executed: Vec::new(),
        };
        step_ctx(&mut ctx).unwrap();
        step_ctx(&mut ctx).unwrap();
        let err = step_ctx(&mut ctx).unwrap_err();
        assert!(matches!(err, StreamError::ServiceCallFailed { state: "a", .. }));
    }

    #[test]
    fn backoff_grows_exponentially() {
        assert_eq!(retry_delay(1) * 2, retry_delay(2));
        assert!(retry_delay(3) > retry_delay(2));
    }
}
