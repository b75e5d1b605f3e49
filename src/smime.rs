//! CMS/PKCS#7 decipher primitive.
//!
//! Takes the DER bytes of one `smime.p7m` blob and the case keyring and
//! returns the embedded plaintext. Opaque-signed bags that masquerade as
//! ciphertext are recognized and passed through without decryption.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use aes::{Aes128, Aes192, Aes256};
use cms::content_info::ContentInfo;
use cms::enveloped_data::{EnvelopedData, KeyTransRecipientInfo, RecipientIdentifier, RecipientInfo};
use cms::signed_data::SignedData;
use const_oid::db::rfc5911::{ID_ENVELOPED_DATA, ID_SIGNED_DATA};
use const_oid::ObjectIdentifier;
use der::asn1::OctetString;
use der::Decode as _;
use des::TdesEde3;
use rsa::Pkcs1v15Encrypt;
use spki::AlgorithmIdentifierOwned;

use crate::keyring::{CertKeyPair, Keyring};

const OID_AES_128_CBC: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.1.2");
const OID_AES_192_CBC: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.1.22");
const OID_AES_256_CBC: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.1.42");
const OID_DES_EDE3_CBC: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.3.7");

/// Error type for the decipher primitive.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("malformed CMS structure: {0}")]
    Malformed(#[from] der::Error),
    #[error("unsupported CMS content type {0}")]
    UnsupportedContentType(ObjectIdentifier),
    #[error("signed-data bag carries no encapsulated content")]
    MissingContent,
    #[error("enveloped-data carries no encrypted content")]
    MissingCiphertext,
    #[error("no recipient info matches any keyring certificate")]
    NoMatchingRecipient,
    #[error("cannot decrypt content-encryption key: {0}")]
    KeyTransport(#[from] rsa::errors::Error),
    #[error("unsupported content-encryption algorithm {0}")]
    UnsupportedAlgorithm(ObjectIdentifier),
    #[error("missing or malformed content-encryption IV")]
    BadIv,
    #[error("content-encryption key or IV has the wrong length")]
    BadKeyMaterial,
    #[error("content decryption produced corrupt padding")]
    BadPadding,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Deciphers one CMS blob with the first keyring pair the envelope names.
///
/// `EnvelopedData` is decrypted with RSA key transport and CBC content
/// encryption (AES for current mail, 3DES for legacy). `SignedData` is the
/// opaque-signed passthrough: its embedded content is returned as-is. If no
/// recipient matches, the last per-candidate error is returned.
pub fn decipher(der_bytes: &[u8], keyring: &Keyring) -> Result<Vec<u8>> {
    let content_info = ContentInfo::from_der(der_bytes)?;
    if content_info.content_type == ID_SIGNED_DATA {
        let signed: SignedData = content_info.content.decode_as()?;
        let econtent = signed
            .encap_content_info
            .econtent
            .ok_or(Error::MissingContent)?;
        let octets: OctetString = econtent.decode_as()?;
        Ok(octets.as_bytes().to_vec())
    } else if content_info.content_type == ID_ENVELOPED_DATA {
        let enveloped: EnvelopedData = content_info.content.decode_as()?;
        decrypt_enveloped(&enveloped, keyring)
    } else {
        Err(Error::UnsupportedContentType(content_info.content_type))
    }
}

fn decrypt_enveloped(enveloped: &EnvelopedData, keyring: &Keyring) -> Result<Vec<u8>> {
    let mut last_err = Error::NoMatchingRecipient;
    for pair in keyring.pairs() {
        let Some(ktri) = recipient_for(enveloped, pair) else {
            continue;
        };
        match decrypt_recipient(enveloped, ktri, pair) {
            Ok(plain) => return Ok(plain),
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}

/// The key-transport recipient info addressed to `pair`, if any.
fn recipient_for<'a>(
    enveloped: &'a EnvelopedData,
    pair: &CertKeyPair,
) -> Option<&'a KeyTransRecipientInfo> {
    let tbs = &pair.certificate().tbs_certificate;
    enveloped.recip_infos.0.iter().find_map(|info| {
        let RecipientInfo::Ktri(ktri) = info else {
            return None;
        };
        match &ktri.rid {
            RecipientIdentifier::IssuerAndSerialNumber(ias)
                if ias.serial_number == tbs.serial_number && ias.issuer == tbs.issuer =>
            {
                Some(ktri)
            }
            _ => None,
        }
    })
}

fn decrypt_recipient(
    enveloped: &EnvelopedData,
    ktri: &KeyTransRecipientInfo,
    pair: &CertKeyPair,
) -> Result<Vec<u8>> {
    let cek = pair
        .private_key()
        .decrypt(Pkcs1v15Encrypt, ktri.enc_key.as_bytes())?;
    let info = &enveloped.encrypted_content;
    let ciphertext = info
        .encrypted_content
        .as_ref()
        .ok_or(Error::MissingCiphertext)?;
    decrypt_content(&info.content_enc_alg, &cek, ciphertext.as_bytes())
}

fn decrypt_content(
    algorithm: &AlgorithmIdentifierOwned,
    key: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let iv: OctetString = algorithm
        .parameters
        .as_ref()
        .ok_or(Error::BadIv)?
        .decode_as()
        .map_err(|_| Error::BadIv)?;
    let iv = iv.as_bytes();

    if algorithm.oid == OID_AES_256_CBC {
        cbc_decrypt::<Aes256>(key, iv, ciphertext)
    } else if algorithm.oid == OID_AES_192_CBC {
        cbc_decrypt::<Aes192>(key, iv, ciphertext)
    } else if algorithm.oid == OID_AES_128_CBC {
        cbc_decrypt::<Aes128>(key, iv, ciphertext)
    } else if algorithm.oid == OID_DES_EDE3_CBC {
        cbc_decrypt::<TdesEde3>(key, iv, ciphertext)
    } else {
        Err(Error::UnsupportedAlgorithm(algorithm.oid))
    }
}

fn cbc_decrypt<C>(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>
where
    C: aes::cipher::BlockCipher + aes::cipher::BlockDecryptMut + aes::cipher::KeyInit,
{
    cbc::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::BadKeyMaterial)?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::BadPadding)
}
