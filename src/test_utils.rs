//! Fixtures shared by the unit tests.
//!
//! Everything is synthesized at test time: RSA keys, self-issued
//! certificates, sealed CMS payloads and the eml wrappers around them.
//! The certificates carry dummy signatures, which is fine because nothing
//! in this crate verifies them.

use std::str::FromStr as _;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockEncryptMut as _, KeyIvInit as _};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use cms::builder::{
    ContentEncryptionAlgorithm, EnvelopedDataBuilder, KeyEncryptionInfo,
    KeyTransRecipientInfoBuilder,
};
use cms::cert::{CertificateChoices, IssuerAndSerialNumber};
use cms::content_info::{CmsVersion, ContentInfo};
use cms::enveloped_data::{
    EncryptedContentInfo, EnvelopedData, KeyTransRecipientInfo, RecipientIdentifier, RecipientInfo,
};
use cms::signed_data::{EncapsulatedContentInfo, SignedData, SignerIdentifier, SignerInfo};
use const_oid::db::rfc5911::{ID_DATA, ID_ENVELOPED_DATA, ID_SIGNED_DATA};
use const_oid::{AssociatedOid as _, ObjectIdentifier};
use der::asn1::{BitString, Ia5String, OctetString, SetOfVec, UtcTime};
use der::{Any, DateTime, Decode as _, Encode as _};
use pkcs8::EncodePrivateKey as _;
use rand::RngCore as _;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use spki::{AlgorithmIdentifierOwned, EncodePublicKey as _, SubjectPublicKeyInfoOwned};
use x509_cert::certificate::{TbsCertificate, Version};
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::SubjectAltName;
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::time::{Time, Validity};
use x509_cert::Certificate;

use crate::keyring::CertKeyPair;
use crate::tools::serial_hex;

const OID_RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const OID_SHA256_WITH_RSA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");
const OID_SHA_256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");
const OID_DES_EDE3_CBC: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.3.7");

/// A decrypted inner message, as it would come out of an envelope.
pub(crate) const INNER_PLAINTEXT: &[u8] = b"Content-Type: text/plain\n\
    Content-Transfer-Encoding: 7bit\n\
    \n\
    the quarterly numbers are attached\n";

/// One synthesized recipient or signer.
pub(crate) struct TestIdentity {
    pub common_name: String,
    pub serial_hex: String,
    pub key: RsaPrivateKey,
    pub cert_der: Vec<u8>,
}

impl TestIdentity {
    pub fn certificate(&self) -> Certificate {
        Certificate::from_der(&self.cert_der).expect("fixture cert reparses")
    }

    pub fn public(&self) -> RsaPublicKey {
        RsaPublicKey::from(&self.key)
    }

    pub fn pair(&self) -> CertKeyPair {
        CertKeyPair::new(&self.cert_der, self.key.clone()).expect("fixture pair is consistent")
    }

    pub fn issuer_and_serial(&self) -> IssuerAndSerialNumber {
        let cert = self.certificate();
        IssuerAndSerialNumber {
            issuer: cert.tbs_certificate.issuer.clone(),
            serial_number: cert.tbs_certificate.serial_number.clone(),
        }
    }

    /// Packs the identity into a PKCS#12 container, the input shape of
    /// keyring materialization.
    pub fn to_pkcs12(&self, password: &str) -> Vec<u8> {
        let key_der = self.key.to_pkcs8_der().expect("fixture key encodes");
        p12::PFX::new(
            &self.cert_der,
            key_der.as_bytes(),
            None,
            password,
            &self.common_name,
        )
        .expect("fixture pfx builds")
        .to_der()
    }
}

/// Synthesizes an identity with a fresh RSA key and a serial derived from
/// `seed`. The validity window matches the known harvest fixture.
pub(crate) fn test_identity(common_name: &str, seed: u8) -> TestIdentity {
    build_identity(common_name, seed, None)
}

/// Same, with SAN email and DNS entries.
pub(crate) fn test_identity_with_san(
    common_name: &str,
    seed: u8,
    email: &str,
    dns: &str,
) -> TestIdentity {
    let san = SubjectAltName(vec![
        GeneralName::Rfc822Name(Ia5String::new(email).expect("fixture email encodes")),
        GeneralName::DnsName(Ia5String::new(dns).expect("fixture dns encodes")),
    ]);
    build_identity(common_name, seed, Some(san))
}

fn build_identity(common_name: &str, seed: u8, san: Option<SubjectAltName>) -> TestIdentity {
    let mut rng = rand::thread_rng();
    // 1024 bits keeps keygen fast; plenty for fixture material
    let key = RsaPrivateKey::new(&mut rng, 1024).expect("fixture keygen");
    let serial = [seed; 20];
    let cert = build_certificate(common_name, &serial, &RsaPublicKey::from(&key), san);
    TestIdentity {
        common_name: common_name.to_string(),
        serial_hex: serial_hex(&serial),
        key,
        cert_der: cert.to_der().expect("fixture cert encodes"),
    }
}

fn build_certificate(
    cn: &str,
    serial: &[u8],
    public: &RsaPublicKey,
    san: Option<SubjectAltName>,
) -> Certificate {
    let name =
        Name::from_str(&format!("CN={cn},OU=Forensics,O=USACE,C=US")).expect("fixture name parses");
    let spki_der = public.to_public_key_der().expect("fixture spki encodes");
    let spki =
        SubjectPublicKeyInfoOwned::from_der(spki_der.as_bytes()).expect("fixture spki reparses");
    let algorithm = AlgorithmIdentifierOwned {
        oid: OID_SHA256_WITH_RSA,
        parameters: Some(Any::null()),
    };
    let extensions = san.map(|san| {
        vec![Extension {
            extn_id: SubjectAltName::OID,
            critical: false,
            extn_value: OctetString::new(san.to_der().expect("fixture san encodes"))
                .expect("fixture san wraps"),
        }]
    });
    let tbs = TbsCertificate {
        version: Version::V3,
        serial_number: SerialNumber::new(serial).expect("fixture serial encodes"),
        signature: algorithm.clone(),
        issuer: name.clone(),
        validity: Validity {
            not_before: utc(2020, 4, 17, 15, 56, 38),
            not_after: utc(2021, 4, 17, 15, 56, 38),
        },
        subject: name,
        subject_public_key_info: spki,
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions,
    };
    Certificate {
        tbs_certificate: tbs,
        signature_algorithm: algorithm,
        // nothing in this crate verifies signatures
        signature: BitString::from_bytes(&[0u8; 128]).expect("fixture signature wraps"),
    }
}

fn utc(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Time {
    let datetime = DateTime::new(year, month, day, hour, minute, second).expect("fixture datetime");
    Time::UtcTime(UtcTime::from_date_time(datetime).expect("fixture utctime"))
}

/// Seals `plaintext` for `identity` as AES-256-CBC EnvelopedData.
pub(crate) fn seal_enveloped(identity: &TestIdentity, plaintext: &[u8]) -> Vec<u8> {
    let mut ktri_rng = rand::thread_rng();
    let mut build_rng = rand::thread_rng();
    let ktri = KeyTransRecipientInfoBuilder::new(
        RecipientIdentifier::IssuerAndSerialNumber(identity.issuer_and_serial()),
        KeyEncryptionInfo::Rsa(identity.public()),
        &mut ktri_rng,
    )
    .expect("fixture ktri builder");
    let mut builder =
        EnvelopedDataBuilder::new(None, plaintext, ContentEncryptionAlgorithm::Aes256Cbc, None)
            .expect("fixture enveloped builder");
    builder
        .add_recipient_info(ktri)
        .expect("fixture recipient adds");
    let enveloped = builder
        .build_with_rng(&mut build_rng)
        .expect("fixture envelope builds");
    content_info_der(ID_ENVELOPED_DATA, &enveloped)
}

/// Seals `plaintext` with the legacy 3DES content encryption, assembled
/// by hand because the builder only offers AES.
pub(crate) fn seal_enveloped_3des(identity: &TestIdentity, plaintext: &[u8]) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let mut cek = [0u8; 24];
    let mut iv = [0u8; 8];
    rng.fill_bytes(&mut cek);
    rng.fill_bytes(&mut iv);

    let ciphertext = cbc::Encryptor::<des::TdesEde3>::new_from_slices(&cek, &iv)
        .expect("fixture 3des keying")
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    let enc_key = identity
        .public()
        .encrypt(&mut rng, Pkcs1v15Encrypt, &cek)
        .expect("fixture key transport");

    let ktri = KeyTransRecipientInfo {
        version: CmsVersion::V0,
        rid: RecipientIdentifier::IssuerAndSerialNumber(identity.issuer_and_serial()),
        key_enc_alg: AlgorithmIdentifierOwned {
            oid: OID_RSA_ENCRYPTION,
            parameters: Some(Any::null()),
        },
        enc_key: OctetString::new(enc_key).expect("fixture enc key wraps"),
    };
    let enveloped = EnvelopedData {
        version: CmsVersion::V0,
        originator_info: None,
        recip_infos: SetOfVec::try_from(vec![RecipientInfo::Ktri(ktri)])
            .expect("fixture recipient set")
            .into(),
        encrypted_content: EncryptedContentInfo {
            content_type: ID_DATA,
            content_enc_alg: AlgorithmIdentifierOwned {
                oid: OID_DES_EDE3_CBC,
                parameters: Some(
                    Any::encode_from(&OctetString::new(iv.as_slice()).expect("fixture iv wraps"))
                        .expect("fixture iv encodes"),
                ),
            },
            encrypted_content: Some(OctetString::new(ciphertext).expect("fixture ct wraps")),
        },
        unprotected_attrs: None,
    };
    content_info_der(ID_ENVELOPED_DATA, &enveloped)
}

/// An opaque-signed bag: SignedData with the content embedded.
pub(crate) fn seal_signed(identity: &TestIdentity, content: &[u8]) -> Vec<u8> {
    let econtent = OctetString::new(content).expect("fixture econtent wraps");
    let signed = signed_data(identity, Some(econtent));
    content_info_der(ID_SIGNED_DATA, &signed)
}

/// A detached signature bag, as found in `multipart/signed` mail.
pub(crate) fn detached_signature(identity: &TestIdentity) -> Vec<u8> {
    let signed = signed_data(identity, None);
    content_info_der(ID_SIGNED_DATA, &signed)
}

fn signed_data(identity: &TestIdentity, econtent: Option<OctetString>) -> SignedData {
    let digest_alg = AlgorithmIdentifierOwned {
        oid: OID_SHA_256,
        parameters: None,
    };
    let signer_info = SignerInfo {
        version: CmsVersion::V1,
        sid: SignerIdentifier::IssuerAndSerialNumber(identity.issuer_and_serial()),
        digest_alg: digest_alg.clone(),
        signed_attrs: None,
        signature_algorithm: AlgorithmIdentifierOwned {
            oid: OID_RSA_ENCRYPTION,
            parameters: Some(Any::null()),
        },
        signature: OctetString::new([0u8; 128].as_slice()).expect("fixture signature wraps"),
        unsigned_attrs: None,
    };
    SignedData {
        version: CmsVersion::V1,
        digest_algorithms: SetOfVec::try_from(vec![digest_alg])
            .expect("fixture digest set")
            .into(),
        encap_content_info: EncapsulatedContentInfo {
            econtent_type: ID_DATA,
            econtent: econtent
                .map(|content| Any::encode_from(&content).expect("fixture econtent encodes")),
        },
        certificates: Some(
            SetOfVec::try_from(vec![CertificateChoices::Certificate(identity.certificate())])
                .expect("fixture cert set")
                .into(),
        ),
        crls: None,
        signer_infos: SetOfVec::try_from(vec![signer_info])
            .expect("fixture signer set")
            .into(),
    }
}

fn content_info_der<T: der::Encode>(content_type: ObjectIdentifier, content: &T) -> Vec<u8> {
    let content_der = content.to_der().expect("fixture content encodes");
    let info = ContentInfo {
        content_type,
        content: Any::from_der(&content_der).expect("fixture content reparses"),
    };
    info.to_der().expect("fixture content info encodes")
}

/// Base64 with transfer-encoding line folds.
pub(crate) fn fold_base64(bytes: &[u8]) -> String {
    let encoded = STANDARD.encode(bytes);
    encoded
        .as_bytes()
        .chunks(64)
        .map(|chunk| std::str::from_utf8(chunk).expect("base64 is ascii"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// A plain envelope as libpst expands it: outer transport headers plus
/// the `smime.p7m` payload.
pub(crate) fn enveloped_eml(identity: &TestIdentity, plaintext: &[u8]) -> Vec<u8> {
    let payload = fold_base64(&seal_enveloped(identity, plaintext));
    format!(
        "From: custodian@example.mil\n\
         To: counsel@example.com\n\
         Subject: quarterly numbers\n\
         Date: Mon, 1 Jun 2020 10:00:00 +0000\n\
         Message-ID: <outer-1@example.mil>\n\
         X-MS-Has-Attach: yes\n\
         Content-Type: application/pkcs7-mime; smime-type=enveloped-data; name=\"smime.p7m\"\n\
         Content-Disposition: attachment; filename=\"smime.p7m\"\n\
         Content-Transfer-Encoding: base64\n\
         \n\
         {payload}\n"
    )
    .into_bytes()
}

/// A clear-signed message, the harvester's input shape.
pub(crate) fn signed_eml(identity: &TestIdentity, body: &[u8]) -> Vec<u8> {
    let signature = fold_base64(&detached_signature(identity));
    let body = String::from_utf8_lossy(body);
    format!(
        "From: custodian@example.mil\n\
         To: counsel@example.com\n\
         Subject: signed memo\n\
         Date: Fri, 17 Apr 2020 15:56:38 +0000\n\
         Message-ID: <memo-1@example.mil>\n\
         Content-Type: multipart/signed; protocol=\"application/pkcs7-signature\"; \
         micalg=sha-256; boundary=\"sigB\"\n\
         \n\
         --sigB\n\
         Content-Type: text/plain\n\
         \n\
         {body}\n\
         --sigB\n\
         Content-Type: application/pkcs7-signature; name=\"smime.p7s\"\n\
         Content-Transfer-Encoding: base64\n\
         Content-Disposition: attachment; filename=\"smime.p7s\"\n\
         \n\
         {signature}\n\
         --sigB--\n"
    )
    .into_bytes()
}
