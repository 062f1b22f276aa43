//! Table output for `herald instances` and `herald requests`.

use std::io::{self, Write};
use std::time::Duration;

use chrono::{DateTime, Utc};

use herald_core::{Instance, Request};

/// Compact "how long ago" for a timestamp.
pub fn ago(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = now.signed_duration_since(then).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}

pub fn write_instances(
    w: &mut impl Write,
    instances: &[Instance],
    now: DateTime<Utc>,
    stale_after: Duration,
) -> io::Result<()> {
    if instances.is_empty() {
        writeln!(w, "No instances registered")?;
        return Ok(());
    }
    writeln!(
        w,
        "{:<16} {:<8} {:<16} {:<10} ROLE",
        "NAME", "STATUS", "CHANNEL", "LAST SEEN"
    )?;
    for inst in instances {
        writeln!(
            w,
            "{:<16} {:<8} {:<16} {:<10} {}",
            inst.name,
            inst.liveness(now, stale_after).as_str(),
            inst.channel,
            ago(inst.last_seen, now),
            inst.role
        )?;
    }
    Ok(())
}

pub fn write_requests(w: &mut impl Write, requests: &[Request]) -> io::Result<()> {
    if requests.is_empty() {
        writeln!(w, "No requests")?;
        return Ok(());
    }
    writeln!(
        w,
        "{:<6} {:<10} {:<16} {:<14} {:<20} REQUEST",
        "ID", "STATUS", "FROM", "CHAT", "CREATED"
    )?;
    for req in requests {
        writeln!(
            w,
            "{:<6} {:<10} {:<16} {:<14} {:<20} {}",
            req.id,
            req.status.as_str(),
            req.requester_label(),
            req.chat_id,
            req.created_at.format("%Y-%m-%d %H:%M:%S"),
            req.preview(60)
        )?;
    }
    Ok(())
}
