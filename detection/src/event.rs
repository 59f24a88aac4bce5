//! Motion-event state machine.
//!
//! Consumes the per-frame verdicts from the detection model and decides
//! what the camera loop must do: open and close movies, flush the
//! pre-capture ring, announce event boundaries, run hook scripts. The
//! machine itself performs no I/O; every decision is returned as an
//! [`EventAction`] which the hub executes in order, so the whole event
//! lifecycle can be tested as a pure trace.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::time::{Duration, Instant};

use log::{debug, info};

use crate::frame::{DiffResult, Frame, FrameVerdict, Location, Timestamp};

/// Lifecycle phase of one camera's event machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPhase {
    Idle,
    /// An event is open and the gap timer has not expired.
    Motion,
    /// The gap expired; the terminal post-capture frames are being written.
    /// Motion seen here is recorded as post frames only, never re-arms the
    /// event.
    PostMotion,
}

/// Which part of the event a written frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Pre,
    Motion,
    Post,
}

#[derive(Debug, Clone)]
pub struct EventConfig {
    /// Consecutive motion frames required to open an event; 0 is coerced
    /// to 1.
    pub minimum_motion_frames: usize,
    /// Quiet time after the last motion frame before the event closes.
    pub event_gap: Duration,
    /// Frames preserved from before the triggering instant.
    pub pre_capture: usize,
    /// Frames written unconditionally once the gap expires.
    pub post_capture: usize,
    /// Treat every frame as motion; events then never end on their own.
    pub emulate_motion: bool,
    /// 3x3 grid cells (1..=9) that arm the area-detect callback.
    pub area_detect: Vec<u8>,
}

impl Default for EventConfig {
    fn default() -> Self {
        EventConfig {
            minimum_motion_frames: 1,
            event_gap: Duration::from_secs(60),
            pre_capture: 0,
            post_capture: 0,
            emulate_motion: false,
            area_detect: Vec::new(),
        }
    }
}

/// One buffered frame with everything the writers need.
#[derive(Debug)]
pub struct RingEntry {
    pub frame: Frame,
    pub diff: DiffResult,
    pub verdict: FrameVerdict,
}

/// What the camera loop must carry out, in order, for one offered frame.
#[derive(Debug)]
pub enum EventAction {
    EventStart {
        event_id: u64,
        time: Timestamp,
    },
    OpenMovie {
        event_id: u64,
        time: Timestamp,
    },
    /// Fired once per event, right after the start actions.
    MotionDetected,
    /// Fired once per event when the motion center first enters one of the
    /// configured grid cells.
    AreaDetected {
        cell: u8,
    },
    WriteFrame {
        entry: Box<RingEntry>,
        phase: FramePhase,
        shot: u64,
    },
    CloseMovie {
        event_id: u64,
    },
    EventEnd {
        event_id: u64,
        time: Timestamp,
        location: Option<Location>,
    },
}

/// Fixed-capacity FIFO over owned frames. Old entries are overwritten in
/// place; no pointers into the ring survive a push.
struct PreCaptureRing {
    slots: Vec<Option<RingEntry>>,
    next: usize,
    len: usize,
}

impl PreCaptureRing {
    fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        PreCaptureRing {
            slots,
            next: 0,
            len: 0,
        }
    }

    fn push(&mut self, entry: RingEntry) {
        if self.slots.is_empty() {
            return;
        }
        self.slots[self.next] = Some(entry);
        self.next = (self.next + 1) % self.slots.len();
        self.len = (self.len + 1).min(self.slots.len());
    }

    /// Removes and returns all entries, oldest first.
    fn drain_fifo(&mut self) -> Vec<RingEntry> {
        let cap = self.slots.len();
        if cap == 0 {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(self.len);
        let start = (self.next + cap - self.len) % cap;
        for i in 0..self.len {
            if let Some(e) = self.slots[(start + i) % cap].take() {
                out.push(e);
            }
        }
        self.len = 0;
        self.next = 0;
        out
    }

    fn clear(&mut self) {
        for s in self.slots.iter_mut() {
            *s = None;
        }
        self.len = 0;
        self.next = 0;
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.len
    }
}

pub struct EventMachine {
    conf: EventConfig,
    width: usize,
    height: usize,
    phase: EventPhase,
    ring: PreCaptureRing,
    consecutive: usize,
    event_id: u64,
    shot: u64,
    gap_deadline: Option<Instant>,
    post_remaining: usize,
    event_location: Option<Location>,
    area_fired: bool,
}

impl EventMachine {
    pub fn new(mut conf: EventConfig, width: usize, height: usize) -> Self {
        if conf.minimum_motion_frames == 0 {
            conf.minimum_motion_frames = 1;
        }
        // The ring must hold the pre-capture window plus the motion frames
        // accumulated while the consecutive-frame gate is still closed, so
        // that the first minimum_motion_frames-1 motion frames also make it
        // into the movie.
        let capacity = conf.pre_capture + conf.minimum_motion_frames - 1;
        EventMachine {
            ring: PreCaptureRing::new(capacity),
            conf,
            width,
            height,
            phase: EventPhase::Idle,
            consecutive: 0,
            event_id: 0,
            shot: 0,
            gap_deadline: None,
            post_remaining: 0,
            event_location: None,
            area_fired: false,
        }
    }

    pub fn phase(&self) -> EventPhase {
        self.phase
    }

    pub fn current_event(&self) -> Option<u64> {
        (self.phase != EventPhase::Idle).then_some(self.event_id)
    }

    /// Feeds one frame through the state machine.
    pub fn offer(
        &mut self,
        frame: Frame,
        diff: DiffResult,
        verdict: FrameVerdict,
        now: Instant,
    ) -> Vec<EventAction> {
        let motion = verdict.motion_detected || self.conf.emulate_motion;
        let mut actions = Vec::new();

        match self.phase {
            EventPhase::Idle => {
                if motion {
                    self.consecutive += 1;
                } else {
                    self.consecutive = 0;
                }

                if motion && self.consecutive >= self.conf.minimum_motion_frames {
                    self.begin_event(frame, diff, verdict, now, &mut actions);
                } else {
                    self.ring.push(RingEntry {
                        frame,
                        diff,
                        verdict,
                    });
                }
            }
            EventPhase::Motion => {
                let expired = self
                    .gap_deadline
                    .map(|d| now > d)
                    .unwrap_or(false);
                if expired {
                    debug!("event {} gap expired", self.event_id);
                    self.phase = EventPhase::PostMotion;
                    self.post_remaining = self.conf.post_capture;
                    self.post_frame(frame, diff, verdict, &mut actions);
                } else if motion {
                    self.gap_deadline = Some(now + self.conf.event_gap);
                    if let Some(loc) = verdict.location {
                        self.event_location = Some(match self.event_location {
                            Some(prev) => prev.union(&loc),
                            None => loc,
                        });
                        self.check_area(&loc, &mut actions);
                    }
                    self.write(frame, diff, verdict, FramePhase::Motion, &mut actions);
                }
                // Quiet frames inside the gap are not recorded; the movie
                // picks up again on motion or at the post-capture drain.
            }
            EventPhase::PostMotion => {
                self.post_frame(frame, diff, verdict, &mut actions);
            }
        }

        actions
    }

    /// Closes any open event, e.g. at camera shutdown or emulated-motion
    /// stop.
    pub fn force_end(&mut self, time: Timestamp) -> Vec<EventAction> {
        let mut actions = Vec::new();
        if self.phase != EventPhase::Idle {
            self.end_event(time, &mut actions);
        }
        actions
    }

    fn begin_event(
        &mut self,
        frame: Frame,
        diff: DiffResult,
        verdict: FrameVerdict,
        now: Instant,
        actions: &mut Vec<EventAction>,
    ) {
        self.event_id += 1;
        self.shot = 0;
        self.event_location = verdict.location;
        self.area_fired = false;
        let time = frame.timestamp;

        info!(
            "event {} starts at frame {} ({} changed pixels)",
            self.event_id, frame.index, verdict.changed_pixels
        );

        actions.push(EventAction::EventStart {
            event_id: self.event_id,
            time,
        });
        actions.push(EventAction::OpenMovie {
            event_id: self.event_id,
            time,
        });
        actions.push(EventAction::MotionDetected);
        if let Some(loc) = verdict.location {
            self.check_area(&loc, actions);
        }

        // Pre-capture frames go out first, tagged with their original
        // timestamps, so the movie starts before the triggering instant.
        for entry in self.ring.drain_fifo() {
            let phase = if entry.verdict.motion_detected {
                FramePhase::Motion
            } else {
                FramePhase::Pre
            };
            let shot = self.shot;
            self.shot += 1;
            actions.push(EventAction::WriteFrame {
                entry: Box::new(entry),
                phase,
                shot,
            });
        }

        self.write(frame, diff, verdict, FramePhase::Motion, actions);
        self.gap_deadline = Some(now + self.conf.event_gap);
        self.phase = EventPhase::Motion;
    }

    fn write(
        &mut self,
        frame: Frame,
        diff: DiffResult,
        verdict: FrameVerdict,
        phase: FramePhase,
        actions: &mut Vec<EventAction>,
    ) {
        let shot = self.shot;
        self.shot += 1;
        actions.push(EventAction::WriteFrame {
            entry: Box::new(RingEntry {
                frame,
                diff,
                verdict,
            }),
            phase,
            shot,
        });
    }

    fn post_frame(
        &mut self,
        frame: Frame,
        diff: DiffResult,
        verdict: FrameVerdict,
        actions: &mut Vec<EventAction>,
    ) {
        let time = frame.timestamp;
        if self.post_remaining > 0 {
            self.post_remaining -= 1;
            self.write(frame, diff, verdict, FramePhase::Post, actions);
        }
        if self.post_remaining == 0 {
            self.end_event(time, actions);
        }
    }

    fn end_event(&mut self, time: Timestamp, actions: &mut Vec<EventAction>) {
        info!("event {} ends", self.event_id);
        actions.push(EventAction::CloseMovie {
            event_id: self.event_id,
        });
        actions.push(EventAction::EventEnd {
            event_id: self.event_id,
            time,
            location: self.event_location,
        });
        self.ring.clear();
        self.phase = EventPhase::Idle;
        self.consecutive = 0;
        self.gap_deadline = None;
        self.post_remaining = 0;
        self.event_location = None;
        self.area_fired = false;
    }

    /// 3x3 grid test for the area-detect hook; fires at most once per
    /// event.
    fn check_area(&mut self, loc: &Location, actions: &mut Vec<EventAction>) {
        if self.area_fired || self.conf.area_detect.is_empty() {
            return;
        }
        let col = (loc.x * 3 / self.width.max(1)).min(2);
        let row = (loc.y * 3 / self.height.max(1)).min(2);
        let cell = (row * 3 + col + 1) as u8;
        if self.conf.area_detect.contains(&cell) {
            self.area_fired = true;
            actions.push(EventAction::AreaDetected { cell });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Timestamp;
    use std::time::Duration;

    fn entry(index: u64, motion: bool) -> (Frame, DiffResult, FrameVerdict) {
        let mut frame = Frame::blank(32, 32).unwrap();
        frame.index = index;
        frame.timestamp = Timestamp {
            sec: index as i64,
            usec: 0,
        };
        let diffs = if motion { 200 } else { 0 };
        let verdict = FrameVerdict {
            changed_pixels: diffs,
            noise: 8,
            threshold: 100,
            lightswitch: false,
            motion_detected: motion,
            location: motion.then(|| Location {
                x: 16,
                y: 16,
                width: 8,
                height: 8,
            }),
            total_labels: 0,
        };
        let diff = DiffResult {
            out: vec![0; 32 * 32],
            diffs,
            labels: None,
        };
        (frame, diff, verdict)
    }

    fn conf() -> EventConfig {
        EventConfig {
            minimum_motion_frames: 2,
            event_gap: Duration::from_secs(2),
            pre_capture: 3,
            post_capture: 2,
            emulate_motion: false,
            area_detect: Vec::new(),
        }
    }

    #[test]
    fn idle_frames_fill_but_never_overflow_ring() {
        let mut m = EventMachine::new(conf(), 32, 32);
        let t0 = Instant::now();
        for i in 0..20 {
            let (f, d, v) = entry(i, false);
            assert!(m.offer(f, d, v, t0).is_empty());
        }
        // pre_capture + minimum_motion_frames - 1
        assert_eq!(m.ring.len(), 4);
        assert_eq!(m.phase(), EventPhase::Idle);
    }

    #[test]
    fn event_trace_is_well_ordered() {
        let mut m = EventMachine::new(conf(), 32, 32);
        let t0 = Instant::now();
        let mut trace = Vec::new();
        // 10 quiet, 5 motion, then quiet until the gap (2s) expires.
        for i in 0..10 {
            let (f, d, v) = entry(i, false);
            trace.extend(m.offer(f, d, v, t0));
        }
        for i in 10..15 {
            let (f, d, v) = entry(i, true);
            trace.extend(m.offer(f, d, v, t0 + Duration::from_millis(i * 100)));
        }
        for i in 15..60 {
            let (f, d, v) = entry(i, false);
            trace.extend(m.offer(f, d, v, t0 + Duration::from_millis(i * 100)));
        }

        assert!(matches!(trace[0], EventAction::EventStart { event_id: 1, .. }));
        assert!(matches!(trace[1], EventAction::OpenMovie { .. }));
        assert!(matches!(trace[2], EventAction::MotionDetected));

        let writes: Vec<_> = trace
            .iter()
            .filter_map(|a| match a {
                EventAction::WriteFrame { entry, phase, .. } => Some((entry.frame.index, *phase)),
                _ => None,
            })
            .collect();
        // 3 pre + 1 gated motion frame + 4 live motion + 2 post.
        assert_eq!(writes.len(), 3 + 1 + 4 + 2);
        assert_eq!(writes[0], (7, FramePhase::Pre));
        assert_eq!(writes[2], (9, FramePhase::Pre));
        assert_eq!(writes[3], (10, FramePhase::Motion));
        assert_eq!(writes[4], (11, FramePhase::Motion));
        assert_eq!(writes.last().unwrap().1, FramePhase::Post);

        // Frame timestamps are strictly increasing across the movie.
        let indices: Vec<u64> = writes.iter().map(|w| w.0).collect();
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        assert_eq!(indices, sorted);

        // Close before end, both exactly once, at the very end.
        let n = trace.len();
        assert!(matches!(trace[n - 2], EventAction::CloseMovie { event_id: 1 }));
        assert!(matches!(trace[n - 1], EventAction::EventEnd { event_id: 1, .. }));
        assert_eq!(m.phase(), EventPhase::Idle);
    }

    #[test]
    fn motion_during_postcapture_does_not_rearm() {
        let mut m = EventMachine::new(conf(), 32, 32);
        let t0 = Instant::now();
        for i in 0..3 {
            let (f, d, v) = entry(i, true);
            m.offer(f, d, v, t0 + Duration::from_millis(i * 100));
        }
        // Let the gap expire, then offer motion again during post frames.
        let late = t0 + Duration::from_secs(10);
        let (f, d, v) = entry(50, true);
        let a = m.offer(f, d, v, late);
        assert!(a
            .iter()
            .any(|x| matches!(x, EventAction::WriteFrame { phase: FramePhase::Post, .. })));
        assert_eq!(m.phase(), EventPhase::PostMotion);
        let (f, d, v) = entry(51, true);
        let a = m.offer(f, d, v, late);
        // Second post frame exhausts post_capture = 2 and ends the event.
        assert!(a.iter().any(|x| matches!(x, EventAction::EventEnd { .. })));
        assert_eq!(m.phase(), EventPhase::Idle);
    }

    #[test]
    fn short_quiet_gap_keeps_one_event() {
        let mut m = EventMachine::new(conf(), 32, 32);
        let t0 = Instant::now();
        let mut starts = 0;
        let mut ends = 0;
        let mut i = 0u64;
        let mut t = t0;
        let mut step = |m: &mut EventMachine, motion: bool, starts: &mut i32, ends: &mut i32, i: &mut u64, t: &mut Instant| {
            let (f, d, v) = entry(*i, motion);
            for a in m.offer(f, d, v, *t) {
                match a {
                    EventAction::EventStart { .. } => *starts += 1,
                    EventAction::EventEnd { .. } => *ends += 1,
                    _ => {}
                }
            }
            *i += 1;
            *t += Duration::from_millis(100);
        };
        for _ in 0..20 {
            step(&mut m, true, &mut starts, &mut ends, &mut i, &mut t);
        }
        for _ in 0..3 {
            step(&mut m, false, &mut starts, &mut ends, &mut i, &mut t);
        }
        for _ in 0..20 {
            step(&mut m, true, &mut starts, &mut ends, &mut i, &mut t);
        }
        for _ in 0..40 {
            step(&mut m, false, &mut starts, &mut ends, &mut i, &mut t);
        }
        assert_eq!(starts, 1);
        assert_eq!(ends, 1);
    }

    #[test]
    fn area_detect_fires_once_for_center_cell() {
        let mut c = conf();
        c.area_detect = vec![5];
        c.minimum_motion_frames = 1;
        let mut m = EventMachine::new(c, 32, 32);
        let t0 = Instant::now();
        let mut fired = 0;
        for i in 0..5 {
            let (f, d, v) = entry(i, true);
            for a in m.offer(f, d, v, t0 + Duration::from_millis(i * 100)) {
                if matches!(a, EventAction::AreaDetected { cell: 5 }) {
                    fired += 1;
                }
            }
        }
        assert_eq!(fired, 1);
    }

    #[test]
    fn force_end_closes_open_event() {
        let mut c = conf();
        c.minimum_motion_frames = 1;
        c.emulate_motion = true;
        let mut m = EventMachine::new(c, 32, 32);
        let (f, d, v) = entry(0, false);
        m.offer(f, d, v, Instant::now());
        assert_eq!(m.phase(), EventPhase::Motion);
        let actions = m.force_end(Timestamp { sec: 1, usec: 0 });
        assert!(matches!(actions[0], EventAction::CloseMovie { .. }));
        assert!(matches!(actions[1], EventAction::EventEnd { .. }));
        assert_eq!(m.phase(), EventPhase::Idle);
    }
}
