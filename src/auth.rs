//! Long-term credential handling (RFC 5389, section 10.2).
use stun_codec::rfc5389::attributes::{Fingerprint, MessageIntegrity, Nonce, Realm, Username};

use crate::attribute::Message;
use crate::{Error, ErrorKind, Result};

/// Credential context for the long-term mechanism.
///
/// Holds the username/password pair plus the realm and nonce cached from the
/// most recent server challenge. The integrity key, MD5 of
/// `username:realm:password`, is derived by the codec when the
/// MESSAGE-INTEGRITY attribute is computed or checked.
#[derive(Debug, Clone)]
pub(crate) struct AuthParams {
    username: Username,
    password: String,
    realm: Option<Realm>,
    nonce: Option<Nonce>,
}
impl AuthParams {
    pub fn new(username: String, password: String) -> Result<Self> {
        let username = track!(Username::new(username).map_err(Error::from))?;
        Ok(AuthParams {
            username,
            password,
            realm: None,
            nonce: None,
        })
    }

    /// Returns `true` once a server challenge has been cached.
    pub fn has_challenge(&self) -> bool {
        self.realm.is_some() && self.nonce.is_some()
    }

    /// Caches the realm and nonce carried by a 401 or 438 error response.
    ///
    /// A 438 may omit REALM, in which case the cached one is kept.
    pub fn update_from_challenge(&mut self, response: &Message) -> Result<()> {
        if let Some(realm) = response.get_attribute::<Realm>() {
            self.realm = Some(realm.clone());
        }
        let nonce: &Nonce = track_assert_some!(
            response.get_attribute(),
            ErrorKind::Protocol,
            "Challenge without NONCE"
        );
        self.nonce = Some(nonce.clone());
        track_assert!(
            self.realm.is_some(),
            ErrorKind::Protocol,
            "Challenge without REALM"
        );
        Ok(())
    }

    /// Appends USERNAME, REALM, NONCE and MESSAGE-INTEGRITY, in that order.
    ///
    /// MESSAGE-INTEGRITY covers every attribute preceding it; FINGERPRINT,
    /// if any, must be appended afterwards.
    pub fn add_auth_attributes(&self, request: &mut Message) -> Result<()> {
        let realm = track_assert_some!(self.realm.clone(), ErrorKind::Other, "No realm cached");
        let nonce = track_assert_some!(self.nonce.clone(), ErrorKind::Other, "No nonce cached");
        request.add_attribute(self.username.clone());
        request.add_attribute(realm.clone());
        request.add_attribute(nonce);
        let mi = track!(MessageIntegrity::new_long_term_credential(
            request,
            &self.username,
            &realm,
            &self.password
        )
        .map_err(Error::from))?;
        request.add_attribute(mi);
        Ok(())
    }

    /// Verifies MESSAGE-INTEGRITY on a decoded response.
    pub fn validate(&self, mi: &MessageIntegrity) -> Result<()> {
        let realm = track_assert_some!(self.realm.as_ref(), ErrorKind::Other, "No realm cached");
        track_assert!(
            mi.check_long_term_credential(&self.username, realm, &self.password)
                .is_ok(),
            ErrorKind::Protocol,
            "MESSAGE-INTEGRITY mismatch"
        );
        Ok(())
    }
}

/// Appends FINGERPRINT as the final attribute of `message`.
pub(crate) fn attach_fingerprint(message: &mut Message) -> Result<()> {
    let fingerprint = track!(Fingerprint::new(message).map_err(Error::from))?;
    message.add_attribute(fingerprint);
    Ok(())
}
