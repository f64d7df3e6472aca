//! Executes humanized input plans over `Input.dispatchMouseEvent` /
//! `Input.dispatchKeyEvent`.
//!
//! The plans themselves come from `replaymux_humanize`; this driver walks
//! them step by step, re-checking the abort latch between sweeps so a
//! resolved detection stops moving the pointer immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use replaymux_cdp::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams, DispatchMouseEventType,
};
use replaymux_cdp::cdp::browser_protocol::target::SessionId;
use replaymux_humanize::approach::{ApproachPlan, Segment};
use replaymux_humanize::presence::{PresenceKey, PresencePlan};
use replaymux_humanize::{timing, Point};

use crate::error::Result;
use crate::session::SessionHandle;

pub(crate) struct MouseDriver<'a> {
    handle: &'a SessionHandle,
    session: &'a SessionId,
}

impl<'a> MouseDriver<'a> {
    pub fn new(handle: &'a SessionHandle, session: &'a SessionId) -> Self {
        Self { handle, session }
    }

    async fn dispatch_move(&self, p: Point) -> Result<()> {
        self.handle
            .execute_on(self.session, DispatchMouseEventParams::moved(p.x, p.y))
            .await?;
        Ok(())
    }

    /// Walks one sweep; returns `false` when the abort latch fired mid-way.
    async fn walk_segment(&self, segment: &Segment, aborted: &AtomicBool) -> Result<bool> {
        for (i, point) in segment.points.iter().enumerate() {
            if aborted.load(Ordering::SeqCst) {
                return Ok(false);
            }
            self.dispatch_move(*point).await?;
            if let Some(delay) = segment.delays.get(i) {
                tokio::time::sleep(*delay).await;
            }
        }
        if !segment.pause_after.is_zero() {
            tokio::time::sleep(segment.pause_after).await;
        }
        Ok(true)
    }

    /// Runs a full approach plan; `None` when aborted before landing.
    pub async fn run_approach(
        &self,
        plan: &ApproachPlan,
        aborted: &AtomicBool,
    ) -> Result<Option<Point>> {
        for segment in &plan.segments {
            if !self.walk_segment(segment, aborted).await? {
                return Ok(None);
            }
        }
        Ok(Some(plan.landing))
    }

    /// Plays a presence plan: wandering, occasional scroll, harmless keys.
    pub async fn run_presence(
        &self,
        plan: &PresencePlan,
        aborted: &AtomicBool,
    ) -> Result<Point> {
        for mv in &plan.moves {
            for point in &mv.path {
                if aborted.load(Ordering::SeqCst) {
                    return Ok(plan.final_position);
                }
                self.dispatch_move(*point).await?;
                tokio::time::sleep(mv.step_delay).await;
            }
            let here = mv.path.last().copied().unwrap_or(plan.final_position);
            if let Some(delta) = mv.scroll_delta {
                self.scroll(here, delta).await?;
            }
            if let Some(key) = mv.keypress {
                let (key, code, vk) = key.key_ident();
                self.key_tap(key, code, vk, timing::tab_key_gap()).await?;
            }
        }
        Ok(plan.final_position)
    }

    /// mousedown, human-length hold, mouseup.
    pub async fn commit_click(&self, p: Point) -> Result<()> {
        self.handle
            .execute_on(
                self.session,
                DispatchMouseEventParams::new(DispatchMouseEventType::MousePressed, p.x, p.y)
                    .left_button(),
            )
            .await?;
        tokio::time::sleep(timing::click_hold()).await;
        self.handle
            .execute_on(
                self.session,
                DispatchMouseEventParams::new(DispatchMouseEventType::MouseReleased, p.x, p.y)
                    .left_button(),
            )
            .await?;
        Ok(())
    }

    pub async fn scroll(&self, at: Point, delta_y: f64) -> Result<()> {
        self.handle
            .execute_on(self.session, DispatchMouseEventParams::wheel(at.x, at.y, delta_y))
            .await?;
        Ok(())
    }

    /// keyDown, gap, keyUp for a named key.
    pub async fn key_tap(&self, key: &str, code: &str, vk: i64, gap: Duration) -> Result<()> {
        self.handle
            .execute_on(
                self.session,
                DispatchKeyEventParams::named(DispatchKeyEventType::KeyDown, key, code, vk),
            )
            .await?;
        tokio::time::sleep(gap).await;
        self.handle
            .execute_on(
                self.session,
                DispatchKeyEventParams::named(DispatchKeyEventType::KeyUp, key, code, vk),
            )
            .await?;
        Ok(())
    }

    pub async fn tab(&self) -> Result<()> {
        self.key_tap("Tab", "Tab", 9, timing::tab_key_gap()).await
    }

    pub async fn space(&self) -> Result<()> {
        self.key_tap(" ", "Space", 32, timing::tab_key_gap()).await
    }
}

/// Keys reachable from presence plans must map onto dispatchable idents.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_keys_have_idents() {
        for key in [PresenceKey::Tab, PresenceKey::ArrowDown, PresenceKey::ArrowUp] {
            let (name, code, vk) = key.key_ident();
            assert!(!name.is_empty());
            assert!(!code.is_empty());
            assert!(vk > 0);
        }
    }
}
