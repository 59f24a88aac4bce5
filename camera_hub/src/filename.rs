//! Filename format expansion.
//!
//! User-supplied picture/movie/snapshot filenames are strftime strings
//! with extra `%` specifiers for event state (event number, shot, diffs,
//! noise, bounding box, camera identity and so on) plus `%{word}` long
//! specifiers. Motion-specific codes are substituted first with optional
//! numeric minimum widths; whatever remains is handed to strftime in
//! local time.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::ffi::CStr;
use std::fmt::Write as _;

use chrono::{Local, TimeZone};
use vigil_detection::frame::{Location, Timestamp};

/// Everything the specifiers can reference, borrowed from the camera loop
/// for the duration of one expansion.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatContext<'a> {
    pub camera_name: &'a str,
    pub camera_id: u32,
    pub event_nr: u64,
    pub shot: u64,
    pub diffs: usize,
    pub noise: u8,
    pub threshold: usize,
    pub location: Option<Location>,
    pub total_labels: usize,
    pub width: usize,
    pub height: usize,
    pub fps: u32,
    pub text_event: &'a str,
    pub host: &'a str,
    /// Present when expanding an SQL/hook string that references the file.
    pub filename: Option<&'a str>,
    /// Numeric file-kind id for `%n`.
    pub file_kind: Option<u32>,
}

fn pad(value: impl std::fmt::Display, width: usize) -> String {
    if width > 0 {
        format!("{:>w$}", value, w = width)
    } else {
        value.to_string()
    }
}

fn zero_pad(value: impl std::fmt::Display, width: usize) -> String {
    format!("{:0>w$}", value, w = if width > 0 { width } else { 2 })
}

/// Expands `userformat` against `ctx`, then applies strftime for `time`
/// in local time. Unknown `%X` codes pass through to strftime; unknown
/// `%{word}` specifiers are logged and replaced with `~`.
pub fn expand(userformat: &str, ctx: &FormatContext, time: Timestamp) -> String {
    let chars: Vec<char> = userformat.chars().collect();
    let mut fmt = String::with_capacity(userformat.len() * 2);
    let loc = ctx.location.unwrap_or_default();

    let mut i = 0;
    while i < chars.len() {
        if chars[i] != '%' {
            fmt.push(chars[i]);
            i += 1;
            continue;
        }

        // Optional minimum-width prefix, e.g. %04v.
        let mut j = i + 1;
        let mut width = 0usize;
        while j < chars.len() && chars[j].is_ascii_digit() {
            width = width * 10 + chars[j].to_digit(10).unwrap() as usize;
            j += 1;
        }
        if j >= chars.len() {
            break;
        }

        let mut consumed = j + 1;
        match chars[j] {
            'v' => fmt.push_str(&zero_pad(ctx.event_nr, width)),
            'q' => fmt.push_str(&zero_pad(ctx.shot, width)),
            'D' => fmt.push_str(&pad(ctx.diffs, width)),
            'N' => fmt.push_str(&pad(ctx.noise, width)),
            'i' => fmt.push_str(&pad(loc.width, width)),
            'J' => fmt.push_str(&pad(loc.height, width)),
            'K' => fmt.push_str(&pad(loc.x, width)),
            'L' => fmt.push_str(&pad(loc.y, width)),
            'o' => fmt.push_str(&pad(ctx.threshold, width)),
            'Q' => fmt.push_str(&pad(ctx.total_labels, width)),
            't' => fmt.push_str(&pad(ctx.camera_id, width)),
            'C' => fmt.push_str(ctx.text_event),
            'w' => fmt.push_str(&pad(ctx.width, width)),
            'h' => fmt.push_str(&pad(ctx.height, width)),
            'f' => {
                if chars.get(j + 1) == Some(&'p') && chars.get(j + 2) == Some(&'s') {
                    fmt.push_str(&pad(ctx.fps, width));
                    consumed = j + 3;
                } else if let Some(name) = ctx.filename {
                    fmt.push_str(name);
                }
            }
            'n' => {
                if let Some(kind) = ctx.file_kind {
                    fmt.push_str(&pad(kind, width));
                }
            }
            '$' => fmt.push_str(ctx.camera_name),
            '{' => {
                let mut k = j + 1;
                let mut word = String::new();
                while k < chars.len() && chars[k] != '}' {
                    word.push(chars[k]);
                    k += 1;
                }
                consumed = if k < chars.len() { k + 1 } else { k };
                match word.as_str() {
                    "host" => fmt.push_str(&pad(ctx.host, width)),
                    "fps" => fmt.push_str(&pad(ctx.fps, width)),
                    "ver" => fmt.push_str(&pad(env!("CARGO_PKG_VERSION"), width)),
                    _ => {
                        error!("invalid format specifier keyword {:?}", word);
                        fmt.push('~');
                    }
                }
            }
            // Everything else is strftime's business; the width prefix is
            // not forwarded.
            other => {
                fmt.push('%');
                fmt.push(other);
            }
        }
        i = consumed;
    }

    let dt = match Local.timestamp_opt(time.sec, time.usec * 1000).single() {
        Some(dt) => dt,
        None => Local::now(),
    };
    let mut out = String::new();
    if write!(&mut out, "{}", dt.format(&fmt)).is_err() {
        warn!("invalid strftime conversion in {:?}", userformat);
        return fmt;
    }
    out
}

/// Local machine name for `%{host}`.
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len() - 1) };
    if rc == 0 {
        if let Ok(s) = unsafe { CStr::from_ptr(buf.as_ptr() as *const libc::c_char) }.to_str() {
            return s.to_string();
        }
    }
    "localhost".to_string()
}
