//! Key generation and the PKCS#12 container format.

use chrono::{DateTime, Days, Months, NaiveTime, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::{X509NameBuilder, X509Ref, X509};

use super::TlsIdentity;
use crate::config::{IDENTITY_BACKDATE_DAYS, IDENTITY_KEY_BITS, IDENTITY_VALIDITY_YEARS};

/// Containers are written without a password; the file is protected by
/// filesystem permissions.
const CONTAINER_PASSWORD: &str = "";

pub(super) struct Generated {
    pub identity: TlsIdentity,
    pub pkcs12_der: Vec<u8>,
}

/// Generate a self-signed identity valid from the day before `now` to five
/// years after it, both anchored at midnight UTC.
pub(super) fn generate(subject: &str, now: DateTime<Utc>) -> Result<Generated, ErrorStack> {
    let today = now.date_naive();
    let not_before = today
        .checked_sub_days(Days::new(IDENTITY_BACKDATE_DAYS as u64))
        .unwrap_or(today)
        .and_time(NaiveTime::MIN)
        .and_utc();
    let not_after = today
        .checked_add_months(Months::new(IDENTITY_VALIDITY_YEARS as u32 * 12))
        .unwrap_or(today)
        .and_time(NaiveTime::MIN)
        .and_utc();

    let rsa = Rsa::generate(IDENTITY_KEY_BITS)?;
    let key = PKey::from_rsa(rsa)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, subject)?;
    let name = name.build();

    let serial = {
        let mut bn = BigNum::new()?;
        bn.rand(127, MsbOption::MAYBE_ZERO, false)?;
        bn.to_asn1_integer()?
    };

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&key)?;
    let not_before_asn1 = Asn1Time::from_unix(not_before.timestamp())?;
    let not_after_asn1 = Asn1Time::from_unix(not_after.timestamp())?;
    builder.set_not_before(&not_before_asn1)?;
    builder.set_not_after(&not_after_asn1)?;

    builder.append_extension(BasicConstraints::new().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .build()?,
    )?;
    builder.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;
    let key_id = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
    builder.append_extension(key_id)?;
    let mut san = SubjectAlternativeName::new();
    san.dns("localhost").ip("127.0.0.1");
    if is_dns_label(subject) {
        san.dns(subject);
    }
    let san = san.build(&builder.x509v3_context(None, None))?;
    builder.append_extension(san)?;

    builder.sign(&key, MessageDigest::sha256())?;
    let cert = builder.build();

    let pkcs12_der = Pkcs12::builder()
        .name(subject)
        .pkey(&key)
        .cert(&cert)
        .build2(CONTAINER_PASSWORD)?
        .to_der()?;

    let identity = identity_from_parts(&cert, &key)?;
    Ok(Generated {
        identity,
        pkcs12_der,
    })
}

/// Parse a persisted container back into an identity.
pub(super) fn decode(bytes: &[u8]) -> Result<TlsIdentity, String> {
    let parsed = Pkcs12::from_der(bytes)
        .and_then(|pkcs12| pkcs12.parse2(CONTAINER_PASSWORD))
        .map_err(|e| format!("not a PKCS#12 container: {}", e))?;

    let cert = parsed
        .cert
        .ok_or_else(|| "container holds no certificate".to_string())?;
    let key = parsed
        .pkey
        .ok_or_else(|| "container holds no private key".to_string())?;

    if !cert
        .public_key()
        .map(|public| public.public_eq(&key))
        .unwrap_or(false)
    {
        return Err("private key does not match certificate".to_string());
    }

    identity_from_parts(&cert, &key).map_err(|e| e.to_string())
}

fn identity_from_parts(cert: &X509Ref, key: &PKey<Private>) -> Result<TlsIdentity, ErrorStack> {
    let subject = cert
        .subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .map(|entry| String::from_utf8_lossy(entry.data().as_slice()).into_owned())
        .unwrap_or_default();

    Ok(TlsIdentity {
        certificate_der: cert.to_der()?,
        private_key_der: key.private_key_to_pkcs8()?,
        subject,
        not_before: asn1_to_utc(cert.not_before())?,
        not_after: asn1_to_utc(cert.not_after())?,
        key_bits: key.bits(),
    })
}

fn asn1_to_utc(time: &openssl::asn1::Asn1TimeRef) -> Result<DateTime<Utc>, ErrorStack> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    Ok(DateTime::from_timestamp(secs, 0).unwrap_or_default())
}

fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}
