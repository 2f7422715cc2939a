//! Password-policy hook points invoked by the dispatcher around bind.
//!
//! Only the two hooks are implemented here; policy administration and the
//! storage schemes live elsewhere.

use chrono::NaiveDateTime;
use tracing::debug;

use ferrodir_core::config::PasswordSection;
use ferrodir_core::entry::Entry;
use ferrodir_core::error::{LdapError, LdapResult};

/// Verdict of the expiration check after a successful authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PwVerdict {
    /// Nothing to report.
    Ok,
    /// The password expires soon; the response should carry an expiring
    /// control with the remaining seconds.
    Warning { seconds_left: i64 },
    /// The password is expired but a grace login was consumed.
    Grace { remaining: u32 },
}

/// Parses an LDAP GeneralizedTime value (`YYYYmmddHHMMSSZ`).
fn parse_generalized_time(s: &str) -> Option<i64> {
    let trimmed = s.strip_suffix('Z').unwrap_or(s);
    NaiveDateTime::parse_from_str(trimmed, "%Y%m%d%H%M%S")
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

fn attr_i64(entry: &Entry, ty: &str) -> Option<i64> {
    entry.first_value_str(ty).and_then(|s| s.parse().ok())
}

fn attr_bool(entry: &Entry, ty: &str) -> bool {
    entry
        .first_value_str(ty)
        .is_some_and(|v| v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("on"))
}

/// Evaluates account-lock state after authentication and before returning
/// bind success: `nsAccountLock`, `accountUnlockTime`, and the retry
/// counter against the effective policy.
pub fn check_account_lock(
    entry: &Entry,
    policy: &PasswordSection,
    now_secs: i64,
) -> LdapResult<()> {
    if attr_bool(entry, "nsAccountLock") {
        debug!(dn = entry.sdn().as_ndn(), "account is administratively inactivated");
        return Err(LdapError::ConstraintViolation("Account inactivated".into()));
    }
    if !policy.lockout {
        return Ok(());
    }
    let retries = attr_i64(entry, "passwordRetryCount").unwrap_or(0);
    if retries >= i64::from(policy.retry_limit) {
        // Locked out unless the unlock time has passed.
        match entry
            .first_value_str("accountUnlockTime")
            .and_then(parse_generalized_time)
        {
            Some(unlock) if unlock <= now_secs => Ok(()),
            Some(_) | None => Err(LdapError::ConstraintViolation(
                "Exceeded password retry limit".into(),
            )),
        }
    } else {
        Ok(())
    }
}

/// Evaluates password expiration after a successful authentication:
/// permit, warn, or fail the bind.
pub fn need_new_pw(
    entry: &mut Entry,
    policy: &PasswordSection,
    now_secs: i64,
) -> LdapResult<PwVerdict> {
    if !policy.exp {
        return Ok(PwVerdict::Ok);
    }
    let Some(exp_time) = entry
        .first_value_str("passwordExpirationTime")
        .and_then(parse_generalized_time)
    else {
        return Ok(PwVerdict::Ok);
    };

    if now_secs >= exp_time {
        // Expired: a grace login may still be available.
        let used = attr_i64(entry, "passwordGraceUserTime").unwrap_or(0);
        if used < i64::from(policy.grace_limit) {
            let used = used + 1;
            entry.replace_values("passwordGraceUserTime", vec![used.to_string().into()])?;
            debug!(dn = entry.sdn().as_ndn(), used, "grace login consumed");
            return Ok(PwVerdict::Grace {
                remaining: policy.grace_limit - used as u32,
            });
        }
        return Err(LdapError::InvalidCredentials);
    }

    let seconds_left = exp_time - now_secs;
    if seconds_left <= policy.warning_secs {
        if !attr_bool(entry, "passwordExpWarned") {
            entry.replace_values("passwordExpWarned", vec!["true".into()])?;
        }
        return Ok(PwVerdict::Warning { seconds_left });
    }
    Ok(PwVerdict::Ok)
}
