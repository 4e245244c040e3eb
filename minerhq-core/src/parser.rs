//! Extraction of share and block events from device log lines.
//!
//! Each firmware family gets its own matcher. [`parse_line`] tries the
//! matchers in [`MATCHERS`] order and the first hit wins. Lines that match
//! nothing are not an error.

use std::sync::LazyLock;

use regex::Regex;

use crate::{Block, BlockValue, DeviceAddr, Event, Share};

/// Fields pulled out of a single line, before device context is attached.
#[derive(Debug, Clone, PartialEq)]
pub enum Matched {
    Share {
        job_id: Box<str>,
        asic: u32,
        difficulty: f64,
    },
    Block {
        difficulty: f64,
        network_difficulty: f64,
    },
}

pub type Matcher = fn(&str) -> Option<Matched>;

/// Known line formats in priority order.
pub const MATCHERS: &[Matcher] = &[nerdqaxe_share, axeos_share, found_block];

// I (858876424) asic_result: (Pri) Job ID: 18 AsicNr: 3 Ver: 23B82202 ... diff 5894.3/18304/3.70G
static NERDQAXE_SHARE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"asic_result:.*Job ID:\s*(\d+)\s+AsicNr:\s*(\d+).*diff\s+([\d.]+)")
        .expect("valid share pattern")
});

// I (16860088) asic_result: ID: 69868e2b00000b0b, ASIC nr: 0, ver: 24564000 ... diff 432.8 of 2048.
static AXEOS_SHARE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"asic_result:.*\bID:\s*([0-9a-fA-F]+),\s*ASIC nr:\s*(\d+).*diff\s+([\d.]+)")
        .expect("valid share pattern")
});

// I (12345) STRATUM_MANAGER: FOUND BLOCK!!! 123456789.0 > 123000.0
static FOUND_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"FOUND BLOCK!{3,}\s+([\d.]+)\s*>\s*([\d.]+)").expect("valid block pattern")
});

pub fn nerdqaxe_share(line: &str) -> Option<Matched> {
    share_from(&NERDQAXE_SHARE, line)
}

pub fn axeos_share(line: &str) -> Option<Matched> {
    share_from(&AXEOS_SHARE, line)
}

pub fn found_block(line: &str) -> Option<Matched> {
    let caps = FOUND_BLOCK.captures(line)?;

    Some(Matched::Block {
        difficulty: caps[1].parse().ok()?,
        network_difficulty: caps[2].parse().ok()?,
    })
}

fn share_from(re: &Regex, line: &str) -> Option<Matched> {
    let caps = re.captures(line)?;

    Some(Matched::Share {
        job_id: caps[1].into(),
        asic: caps[2].parse().ok()?,
        difficulty: caps[3].parse().ok()?,
    })
}

/// Runs a line through every matcher and returns the first hit.
pub fn match_line(line: &str) -> Option<Matched> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    MATCHERS.iter().find_map(|matcher| matcher(line))
}

/// Parses one line streamed by `addr` into an event.
///
/// The hostname defaults to the address and block values are zeroed; the
/// caller enriches both.
pub fn parse_line(addr: &DeviceAddr, line: &str) -> Option<Event> {
    let timestamp = jiff::Timestamp::now();

    let event = match match_line(line)? {
        Matched::Share {
            job_id,
            asic,
            difficulty,
        } => Event::Share(Share {
            addr: addr.clone(),
            hostname: addr.0.clone(),
            timestamp,
            job_id,
            asic,
            difficulty,
        }),
        Matched::Block {
            difficulty,
            network_difficulty,
        } => Event::Block(Block {
            addr: addr.clone(),
            hostname: addr.0.clone(),
            timestamp,
            difficulty,
            network_difficulty,
            value: BlockValue::default(),
        }),
    };

    Some(event)
}
