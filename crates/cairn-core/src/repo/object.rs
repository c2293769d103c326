use cairn_crypto::CryptoEngine;
use cairn_types::error::{CairnError, Result};
use cairn_types::ContentId;

/// Domain-separation marker for object identity binding in AEAD AAD.
const OBJECT_CONTEXT_AAD_PREFIX: &[u8] = b"cairn:object-context:v1\0";

/// Object type tags for the repository envelope format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    FormatDescriptor = 0,
    PackHeader = 1,
    ContentData = 2,
    IndexBlob = 3,
}

impl ObjectType {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::FormatDescriptor),
            1 => Ok(Self::PackHeader),
            2 => Ok(Self::ContentData),
            3 => Ok(Self::IndexBlob),
            _ => Err(CairnError::UnknownObjectType(v)),
        }
    }
}

fn legacy_aad(tag: u8) -> [u8; 1] {
    [tag]
}

fn contextual_aad(tag: u8, context: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(1 + OBJECT_CONTEXT_AAD_PREFIX.len() + context.len());
    aad.push(tag);
    aad.extend_from_slice(OBJECT_CONTEXT_AAD_PREFIX);
    aad.extend_from_slice(context);
    aad
}

/// AAD context binding a content blob to its own ID.
pub fn content_context(id: &ContentId) -> &[u8] {
    id.as_bytes()
}

fn parse_object_envelope(data: &[u8]) -> Result<(u8, ObjectType, &[u8])> {
    let Some((&tag, rest)) = data.split_first() else {
        return Err(CairnError::InvalidFormat("empty object".into()));
    };
    Ok((tag, ObjectType::from_u8(tag)?, rest))
}

fn seal(tag: u8, aad: &[u8], plaintext: &[u8], crypto: &dyn CryptoEngine) -> Result<Vec<u8>> {
    let encrypted = crypto.encrypt(plaintext, aad)?;
    let mut out = Vec::with_capacity(1 + encrypted.len());
    out.push(tag);
    out.extend_from_slice(&encrypted);
    Ok(out)
}

/// Encrypt a typed payload into a repository object.
///
/// Wire format: `[1-byte type_tag][nonce 12][ciphertext + 16-byte tag]`, or
/// `[1-byte type_tag][plaintext]` for unencrypted repositories.
pub fn pack_object(
    obj_type: ObjectType,
    plaintext: &[u8],
    crypto: &dyn CryptoEngine,
) -> Result<Vec<u8>> {
    let tag = obj_type as u8;
    seal(tag, &legacy_aad(tag), plaintext, crypto)
}

/// Like [`pack_object`], additionally binding the object to `context`.
pub fn pack_object_with_context(
    obj_type: ObjectType,
    context: &[u8],
    plaintext: &[u8],
    crypto: &dyn CryptoEngine,
) -> Result<Vec<u8>> {
    let tag = obj_type as u8;
    seal(tag, &contextual_aad(tag, context), plaintext, crypto)
}

fn expect_type(actual: ObjectType, expected: ObjectType) -> Result<()> {
    if actual != expected {
        return Err(CairnError::InvalidFormat(format!(
            "expected {expected:?}, got {actual:?}"
        )));
    }
    Ok(())
}

/// Decrypt a repository object and check its type tag.
pub fn unpack_object_expect(
    data: &[u8],
    expected: ObjectType,
    crypto: &dyn CryptoEngine,
) -> Result<Vec<u8>> {
    let (tag, obj_type, encrypted) = parse_object_envelope(data)?;
    expect_type(obj_type, expected)?;
    crypto.decrypt(encrypted, &legacy_aad(tag))
}

/// Decrypt a context-bound repository object and check its type tag.
pub fn unpack_object_expect_with_context(
    data: &[u8],
    expected: ObjectType,
    context: &[u8],
    crypto: &dyn CryptoEngine,
) -> Result<Vec<u8>> {
    let (tag, obj_type, encrypted) = parse_object_envelope(data)?;
    expect_type(obj_type, expected)?;
    crypto.decrypt(encrypted, &contextual_aad(tag, context))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_crypto::aes_gcm::Aes256GcmEngine;

    fn engine() -> Aes256GcmEngine {
        Aes256GcmEngine::new(&[0x42; 32], &[0x24; 32])
    }

    #[test]
    fn contextual_object_requires_same_context() {
        let e = engine();
        let obj =
            pack_object_with_context(ObjectType::ContentData, b"id-a", b"payload", &e).unwrap();
        assert_eq!(
            unpack_object_expect_with_context(&obj, ObjectType::ContentData, b"id-a", &e)
                .unwrap(),
            b"payload"
        );
        assert!(
            unpack_object_expect_with_context(&obj, ObjectType::ContentData, b"id-b", &e)
                .is_err()
        );
        assert!(unpack_object_expect(&obj, ObjectType::ContentData, &e).is_err());
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let e = engine();
        let obj = pack_object(ObjectType::IndexBlob, b"x", &e).unwrap();
        let err = unpack_object_expect(&obj, ObjectType::PackHeader, &e).unwrap_err();
        assert!(err.to_string().contains("expected PackHeader"));
    }

    #[test]
    fn retagged_object_fails_authentication() {
        let e = engine();
        let mut obj = pack_object(ObjectType::IndexBlob, b"x", &e).unwrap();
        obj[0] = ObjectType::PackHeader as u8;
        assert!(unpack_object_expect(&obj, ObjectType::PackHeader, &e).is_err());
    }

    #[test]
    fn unknown_tag_and_empty_input() {
        let e = engine();
        assert!(matches!(
            unpack_object_expect(&[9, 0, 0], ObjectType::IndexBlob, &e),
            Err(CairnError::UnknownObjectType(9))
        ));
        assert!(unpack_object_expect(&[], ObjectType::IndexBlob, &e).is_err());
    }
}
