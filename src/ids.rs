//! Identifier generation for control-plane records.
//!
//! All record ids are a short type prefix plus random lowercase hex, stable
//! for the lifetime of the record. Wake ids are bare 16-hex tokens used only
//! for dedup correlation.

use rand::RngCore;

/// Produce `len` random lowercase hex characters.
pub fn random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    let mut out = String::with_capacity(len);
    while out.len() < len {
        let word = rng.next_u64();
        out.push_str(&format!("{word:016x}"));
    }
    out.truncate(len);
    out
}

/// Heartbeat program id (`hb-<12 hex>`).
pub fn heartbeat_program_id() -> String {
    format!("hb-{}", random_hex(12))
}

/// Cron program id (`cr-<12 hex>`).
pub fn cron_program_id() -> String {
    format!("cr-{}", random_hex(12))
}

/// Wake event id: 16 random hex characters, no prefix.
pub fn wake_id() -> String {
    random_hex(16)
}

/// Outbox envelope id (`ob-<12 hex>`).
pub fn outbox_id() -> String {
    format!("ob-{}", random_hex(12))
}

/// Identity binding id (`bd-<12 hex>`).
pub fn binding_id() -> String {
    format!("bd-{}", random_hex(12))
}

/// Issue id (`is-<12 hex>`).
pub fn issue_id() -> String {
    format!("is-{}", random_hex(12))
}

/// Run job id (`run-<12 hex>`).
pub fn job_id() -> String {
    format!("run-{}", random_hex(12))
}

/// Forum post id (`fp-<12 hex>`).
pub fn forum_post_id() -> String {
    format!("fp-{}", random_hex(12))
}

/// Command id assigned by the pipeline (`cmd-<12 hex>`).
pub fn command_id() -> String {
    format!("cmd-{}", random_hex(12))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_hex_length_and_charset() {
        for len in [1, 12, 16, 33] {
            let s = random_hex(len);
            assert_eq!(s.len(), len);
            assert!(s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }

    #[test]
    fn prefixed_ids_have_expected_shape() {
        assert!(heartbeat_program_id().starts_with("hb-"));
        assert_eq!(heartbeat_program_id().len(), 15);
        assert_eq!(wake_id().len(), 16);
    }
}
