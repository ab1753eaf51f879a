use super::StageWriter;
use crate::error::{IngestError, IngestResult};
use openpgp::cert::prelude::*;
use openpgp::crypto::{KeyPair, Password, SessionKey};
use openpgp::packet::{PKESK, SKESK};
use openpgp::parse::{PacketParser, PacketParserResult, Parse};
use openpgp::parse::stream::{
    DecryptionHelper, DecryptorBuilder, MessageStructure, VerificationHelper,
};
use openpgp::policy::StandardPolicy;
use openpgp::serialize::stream::{
    Armorer, Compressor, Encryptor2, LiteralWriter, Message,
};
use openpgp::types::{CompressionAlgorithm, SymmetricAlgorithm};
use openpgp::{Cert, Fingerprint, KeyHandle, Packet};
use sequoia_openpgp as openpgp;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Standard policy that still accepts CAST5, the cipher used for outgoing
/// messages.
static POLICY: LazyLock<StandardPolicy<'static>> = LazyLock::new(|| {
    let mut policy = StandardPolicy::new();
    policy.accept_symmetric_algo(SymmetricAlgorithm::CAST5);
    policy
});

pub const MESSAGE_CIPHER: SymmetricAlgorithm = SymmetricAlgorithm::CAST5;

fn crypto_err(context: &str, e: impl std::fmt::Display) -> IngestError {
    IngestError::Crypto(format!("{}: {}", context, e))
}

/// Recipient public key, loaded once per worker.
#[derive(Debug, Clone)]
pub struct PgpKey {
    cert: Cert,
}

impl PgpKey {
    /// Loads the first certificate in `path` that has a usable encryption key.
    pub fn load(path: &Path) -> IngestResult<Self> {
        let parser = CertParser::from_file(path)
            .map_err(|e| crypto_err(&format!("cannot read key file {}", path.display()), e))?;
        for cert in parser {
            let cert = cert.map_err(|e| crypto_err("malformed certificate", e))?;
            if let Ok(key) = Self::from_cert(cert) {
                info!("🔑 PGP recipient key {}", key.fingerprint());
                return Ok(key);
            }
        }
        Err(IngestError::Crypto(format!(
            "no encryption key found in {}",
            path.display()
        )))
    }

    pub fn from_cert(cert: Cert) -> IngestResult<Self> {
        let usable = cert
            .keys()
            .with_policy(&*POLICY, None)
            .supported()
            .alive()
            .revoked(false)
            .for_transport_encryption()
            .next()
            .is_some();
        if !usable {
            return Err(IngestError::Crypto(format!(
                "certificate {} has no encryption key",
                cert.fingerprint()
            )));
        }
        Ok(Self { cert })
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.cert.fingerprint()
    }
}

/// Options for one encrypted message.
#[derive(Debug, Clone)]
pub struct PgpEncrypt {
    pub key: Arc<PgpKey>,
    /// Integrity protection (MDC); outgoing messages always carry it.
    pub with_integrity: bool,
    pub compress: bool,
    pub armor: bool,
    pub file_name: String,
    pub modified: SystemTime,
}

struct PgpStage<'a> {
    message: Message<'a>,
}

impl Write for PgpStage<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.message.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.message.flush()
    }
}

impl StageWriter for PgpStage<'_> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        self.message.finalize().map_err(io::Error::other)
    }
}

impl PgpEncrypt {
    /// Opens the message stack `encrypt -> [armor] -> [compress] -> literal`
    /// on top of `sink`.
    pub fn open<'a>(
        &'a self,
        sink: &'a mut (dyn Write + Send + Sync),
    ) -> IngestResult<Box<dyn StageWriter + 'a>> {
        if !self.with_integrity {
            warn!(
                file = %self.file_name,
                "Integrity protection cannot be disabled; writing MDC anyway"
            );
        }
        let recipients = self
            .key
            .cert
            .keys()
            .with_policy(&*POLICY, None)
            .supported()
            .alive()
            .revoked(false)
            .for_transport_encryption();

        let mut message = Message::new(sink);
        if self.armor {
            message = Armorer::new(message)
                .build()
                .map_err(|e| crypto_err("armor", e))?;
        }
        message = Encryptor2::for_recipients(message, recipients)
            .symmetric_algo(MESSAGE_CIPHER)
            .build()
            .map_err(|e| crypto_err("encryptor", e))?;
        if self.compress {
            message = Compressor::new(message)
                .algo(CompressionAlgorithm::Zip)
                .build()
                .map_err(|e| crypto_err("compressor", e))?;
        }
        let message = LiteralWriter::new(message)
            .filename(&self.file_name)
            .map_err(|e| crypto_err("literal name", e))?
            .date(self.modified)
            .map_err(|e| crypto_err("literal date", e))?
            .build()
            .map_err(|e| crypto_err("literal packet", e))?;

        debug!(
            file = %self.file_name,
            compress = self.compress,
            armor = self.armor,
            "PGP message opened"
        );
        Ok(Box::new(PgpStage { message }))
    }
}

/// Secret key material for reading messages back.
#[derive(Clone)]
pub struct PgpSecretKey {
    cert: Cert,
    password: Option<Password>,
}

impl PgpSecretKey {
    pub fn load(path: &Path, password: Option<&str>) -> IngestResult<Self> {
        let cert = Cert::from_file(path)
            .map_err(|e| crypto_err(&format!("cannot read secret key {}", path.display()), e))?;
        Ok(Self::from_cert(cert, password))
    }

    pub fn from_cert(cert: Cert, password: Option<&str>) -> Self {
        Self {
            cert,
            password: password.filter(|p| !p.is_empty()).map(Password::from),
        }
    }

    /// Usable decryption key pairs. Protected keys that the password does
    /// not unlock are left out.
    fn keypairs(&self) -> Vec<KeyPair> {
        self.cert
            .keys()
            .with_policy(&*POLICY, None)
            .supported()
            .for_transport_encryption()
            .secret()
            .filter_map(|ka| {
                let mut secret = ka.key().clone();
                if secret.secret().is_encrypted() {
                    secret = secret.decrypt_secret(self.password.as_ref()?).ok()?;
                }
                secret.into_keypair().ok()
            })
            .collect()
    }
}

/// Literal-data details recovered from a decrypted message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiteralInfo {
    pub file_name: Option<String>,
}

struct Helper {
    key: PgpSecretKey,
}

impl VerificationHelper for Helper {
    fn get_certs(&mut self, _ids: &[KeyHandle]) -> openpgp::Result<Vec<Cert>> {
        Ok(Vec::new())
    }

    fn check(&mut self, _structure: MessageStructure) -> openpgp::Result<()> {
        Ok(())
    }
}

impl DecryptionHelper for Helper {
    fn decrypt<D>(
        &mut self,
        pkesks: &[PKESK],
        _skesks: &[SKESK],
        sym_algo: Option<SymmetricAlgorithm>,
        mut decrypt: D,
    ) -> openpgp::Result<Option<Fingerprint>>
    where
        D: FnMut(SymmetricAlgorithm, &SessionKey) -> bool,
    {
        for mut pair in self.key.keypairs() {
            for pkesk in pkesks {
                if let Some((algo, session_key)) = pkesk.decrypt(&mut pair, sym_algo) {
                    if decrypt(algo, &session_key) {
                        return Ok(Some(self.key.cert.fingerprint()));
                    }
                }
            }
        }
        Err(anyhow::anyhow!("no secret key could decrypt the message"))
    }
}

/// Returns a reader over the plaintext of the message in `source`.
///
/// Compressed-data packets inside the message are unwrapped transparently.
pub fn decrypt_reader<'a, R>(source: R, key: &PgpSecretKey) -> IngestResult<Box<dyn Read + 'a>>
where
    R: Read + Send + Sync + 'a,
{
    let helper = Helper { key: key.clone() };
    let decryptor = DecryptorBuilder::from_reader(source)
        .map_err(|e| crypto_err("malformed message", e))?
        .with_policy(&*POLICY, None, helper)
        .map_err(|e| crypto_err("decryption failed", e))?;
    Ok(Box::new(decryptor))
}

/// Decrypts a whole message and reports the literal packet's file name.
pub fn decrypt_to_vec(message: &[u8], key: &PgpSecretKey) -> IngestResult<(Vec<u8>, LiteralInfo)> {
    let mut plain = Vec::new();
    decrypt_reader(message, key)?.read_to_end(&mut plain)?;
    let file_name = literal_file_name(message, key)?;
    Ok((plain, LiteralInfo { file_name }))
}

fn literal_file_name(message: &[u8], key: &PgpSecretKey) -> IngestResult<Option<String>> {
    let mut pairs = key.keypairs();
    let mut session: Option<(SymmetricAlgorithm, SessionKey)> = None;
    let mut ppr =
        PacketParser::from_bytes(message).map_err(|e| crypto_err("malformed message", e))?;

    while let PacketParserResult::Some(mut pp) = ppr {
        if let Packet::PKESK(pkesk) = &pp.packet {
            if session.is_none() {
                session = pairs
                    .iter_mut()
                    .find_map(|pair| pkesk.decrypt(pair, None));
            }
        }
        if matches!(pp.packet, Packet::SEIP(_)) {
            let (algo, sk) = session
                .as_ref()
                .ok_or_else(|| IngestError::Crypto("no session key for message".to_string()))?;
            pp.decrypt(*algo, sk)
                .map_err(|e| crypto_err("decryption failed", e))?;
        }
        if let Packet::Literal(lit) = &pp.packet {
            return Ok(lit
                .filename()
                .map(|n| String::from_utf8_lossy(n).into_owned()));
        }
        ppr = pp
            .recurse()
            .map_err(|e| crypto_err("malformed message", e))?
            .1;
    }
    Ok(None)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_cert() -> Cert {
        let (cert, _rev) = CertBuilder::new()
            .add_userid("ingest-test <ingest@example.com>")
            .add_transport_encryption_subkey()
            .generate()
            .unwrap();
        cert
    }

    fn encrypt(data: &[u8], cert: &Cert, compress: bool, armor: bool) -> Vec<u8> {
        let stage = PgpEncrypt {
            key: Arc::new(PgpKey::from_cert(cert.clone()).unwrap()),
            with_integrity: true,
            compress,
            armor,
            file_name: "payload.bin".to_string(),
            modified: SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000),
        };
        let mut out = Vec::new();
        {
            let mut writer = stage.open(&mut out).unwrap();
            writer.write_all(data).unwrap();
            writer.finish().unwrap();
        }
        out
    }

    #[test]
    fn test_round_trip_with_literal_name() {
        let cert = test_cert();
        let data: Vec<u8> = (0..100u8).collect();
        let message = encrypt(&data, &cert, false, false);
        assert_ne!(&message[..], &data[..]);

        let key = PgpSecretKey::from_cert(cert, None);
        let (plain, info) = decrypt_to_vec(&message, &key).unwrap();
        assert_eq!(plain, data);
        assert_eq!(info.file_name.as_deref(), Some("payload.bin"));
    }

    #[test]
    fn test_compressed_and_armored() {
        let cert = test_cert();
        let data = b"compress me please ".repeat(200);
        let message = encrypt(&data, &cert, true, true);
        assert!(message.starts_with(b"-----BEGIN PGP MESSAGE-----"));

        let key = PgpSecretKey::from_cert(cert, None);
        let mut plain = Vec::new();
        decrypt_reader(&message[..], &key)
            .unwrap()
            .read_to_end(&mut plain)
            .unwrap();
        assert_eq!(plain, data);
    }

    #[test]
    fn test_wrong_key_is_crypto_error() {
        let message = encrypt(b"secret", &test_cert(), false, false);
        let other = PgpSecretKey::from_cert(test_cert(), None);
        let err = decrypt_to_vec(&message, &other).unwrap_err();
        assert!(matches!(err, IngestError::Crypto(_)));
    }

    #[test]
    fn test_public_only_cert_is_accepted_for_encryption() {
        let cert = test_cert().strip_secret_key_material();
        assert!(PgpKey::from_cert(cert).is_ok());
    }
}
