use zeroize::Zeroizing;

use cairn_crypto::EncryptionAlgorithm;

use crate::prompt::read_secret;
use crate::CliResult;

pub(crate) const PASSWORD_ENV: &str = "CAIRN_PASSWORD";

/// Passphrase for an existing repository: `--password`, then
/// `$CAIRN_PASSWORD`, then an interactive prompt. Unencrypted repositories
/// need none.
pub(crate) fn get_passphrase(
    flag: Option<&str>,
    encryption: EncryptionAlgorithm,
    location: &str,
) -> CliResult<Option<Zeroizing<String>>> {
    if encryption == EncryptionAlgorithm::None {
        return Ok(None);
    }
    if let Some(pass) = configured_passphrase(flag) {
        return Ok(Some(pass));
    }
    let pass = read_secret(&format!("Enter passphrase for '{location}': "))?;
    Ok(Some(pass))
}

/// Passphrase for a repository being created. Prompts twice when it has to
/// ask.
pub(crate) fn get_init_passphrase(
    flag: Option<&str>,
    encryption: EncryptionAlgorithm,
    location: &str,
) -> CliResult<Option<Zeroizing<String>>> {
    if encryption == EncryptionAlgorithm::None {
        return Ok(None);
    }
    if let Some(pass) = configured_passphrase(flag) {
        return Ok(Some(pass));
    }
    let p1 = read_secret(&format!("Enter new passphrase for '{location}': "))?;
    let p2 = read_secret("Confirm passphrase: ")?;
    if *p1 != *p2 {
        return Err("passphrases do not match".into());
    }
    if p1.is_empty() {
        return Err("passphrase must not be empty".into());
    }
    Ok(Some(p1))
}

fn configured_passphrase(flag: Option<&str>) -> Option<Zeroizing<String>> {
    if let Some(pass) = flag {
        return Some(Zeroizing::new(pass.to_string()));
    }
    std::env::var(PASSWORD_ENV)
        .ok()
        .filter(|p| !p.is_empty())
        .map(Zeroizing::new)
}
