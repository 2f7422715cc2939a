//! Proxied authorization: evaluating the proxy control and swapping the
//! effective requestor identity.

use rasn::prelude::*;
use tracing::debug;

use ferrodir_core::dn::Sdn;
use ferrodir_core::error::{LdapError, LdapResult};

use crate::control::{find_control, oids, LdapControl};

/// Wire form of the version 1 control value.
#[derive(AsnType, Decode, Encode, Debug, Clone, PartialEq)]
struct ProxyAuthV1Payload {
    proxy_dn: OctetString,
    credentials: Option<OctetString>,
}

/// The authorization identity a proxy control resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyIdentity {
    /// No proxy control present.
    None,
    /// Proxy to the anonymous identity.
    Anonymous,
    /// Proxy to a specific DN.
    Dn(Sdn),
}

/// Extracts the proxied authorization identity from the request controls.
///
/// The v2 control value is an `authzId` and must use the `dn:` form; the
/// root DN can never be proxied to.
pub fn proxyauth_get_dn(
    controls: &[LdapControl],
    rootdn_ndn: &str,
) -> LdapResult<ProxyIdentity> {
    if let Some(control) = find_control(controls, oids::PROXIED_AUTH_V2) {
        let value = control
            .value
            .as_ref()
            .ok_or_else(|| LdapError::MalformedMessage("empty proxy control value".into()))?;
        let authz = std::str::from_utf8(value)
            .map_err(|_| LdapError::MalformedMessage("proxy authzId is not UTF-8".into()))?;
        return resolve_authz_id(authz, rootdn_ndn);
    }
    if let Some(control) = find_control(controls, oids::PROXIED_AUTH_V1) {
        let value = control
            .value
            .as_ref()
            .ok_or_else(|| LdapError::MalformedMessage("empty proxy control value".into()))?;
        let payload: ProxyAuthV1Payload = rasn::ber::decode(value)
            .map_err(|e| LdapError::MalformedMessage(format!("bad proxy control value: {e}")))?;
        let dn = String::from_utf8(payload.proxy_dn.to_vec())
            .map_err(|_| LdapError::MalformedMessage("proxy DN is not UTF-8".into()))?;
        return resolve_dn(&dn, rootdn_ndn);
    }
    Ok(ProxyIdentity::None)
}

fn resolve_authz_id(authz: &str, rootdn_ndn: &str) -> LdapResult<ProxyIdentity> {
    let Some(dn) = authz.strip_prefix("dn:") else {
        // Only the dn: authorization form is supported.
        debug!(authz, "proxied authorization id without dn: prefix");
        return Err(LdapError::InsufficientAccess(
            "proxied authorization requires a dn: authzId".into(),
        ));
    };
    resolve_dn(dn, rootdn_ndn)
}

fn resolve_dn(dn: &str, rootdn_ndn: &str) -> LdapResult<ProxyIdentity> {
    if dn.is_empty() {
        return Ok(ProxyIdentity::Anonymous);
    }
    let sdn = Sdn::new(dn)?;
    if !rootdn_ndn.is_empty() && sdn.as_ndn() == rootdn_ndn {
        return Err(LdapError::unwilling(
            "the root DN cannot be used as a proxy identity",
        ));
    }
    Ok(ProxyIdentity::Dn(sdn))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    const ROOT: &str = "cn=directory manager";

    fn v2(authz: &str) -> Vec<LdapControl> {
        vec![LdapControl::new(
            oids::PROXIED_AUTH_V2,
            true,
            Some(Bytes::copy_from_slice(authz.as_bytes())),
        )]
    }

    #[test]
    fn no_control_means_no_proxy() {
        assert_eq!(proxyauth_get_dn(&[], ROOT).unwrap(), ProxyIdentity::None);
    }

    #[test]
    fn dn_authz_id_resolves() {
        let id = proxyauth_get_dn(&v2("dn:uid=app,O=Example"), ROOT).unwrap();
        match id {
            ProxyIdentity::Dn(sdn) => assert_eq!(sdn.as_ndn(), "uid=app,o=example"),
            other => panic!("unexpected identity {other:?}"),
        }
    }

    #[test]
    fn empty_dn_proxies_to_anonymous() {
        assert_eq!(proxyauth_get_dn(&v2("dn:"), ROOT).unwrap(), ProxyIdentity::Anonymous);
    }

    #[test]
    fn non_dn_authz_id_is_insufficient_access() {
        let err = proxyauth_get_dn(&v2("u:someone"), ROOT).unwrap_err();
        assert!(matches!(err, LdapError::InsufficientAccess(_)));
    }

    #[test]
    fn rootdn_cannot_be_proxied() {
        let err = proxyauth_get_dn(&v2("dn:CN=Directory Manager"), ROOT).unwrap_err();
        assert!(matches!(err, LdapError::UnwillingToPerform(_)));
    }

    #[test]
    fn v1_payload_roundtrips() {
        let payload = ProxyAuthV1Payload {
            proxy_dn: Bytes::from_static(b"uid=app,o=example").into(),
            credentials: None,
        };
        let encoded = rasn::ber::encode(&payload).unwrap();
        let controls = vec![LdapControl::new(
            oids::PROXIED_AUTH_V1,
            true,
            Some(Bytes::from(encoded)),
        )];
        match proxyauth_get_dn(&controls, ROOT).unwrap() {
            ProxyIdentity::Dn(sdn) => assert_eq!(sdn.as_ndn(), "uid=app,o=example"),
            other => panic!("unexpected identity {other:?}"),
        }
    }
}
