//! Finding the tokens of a configured PKCS#11 module.

use std::collections::BTreeMap;
use std::sync::Arc;

use cryptoki::slot::Slot;
use log::{debug, info};

use crate::commons::api::{TokenInfo, TokenKind, TokenStatus};
use crate::commons::SignerResult;
use crate::daemon::config::Pkcs11ModuleConfig;

use super::context::Pkcs11Context;


//------------ DiscoveredToken -----------------------------------------------

/// A token present in a slot of a module.
#[derive(Clone, Debug)]
pub struct DiscoveredToken {
    /// The token as it should appear in the registry.
    pub info: TokenInfo,
    pub slot: Slot,
    pub context: Arc<Pkcs11Context>,
}


//------------ Discovery -----------------------------------------------------

/// Lists the tokens currently present in the slots of a module.
///
/// Slots are numbered in the order the library reports them. When the
/// module lists slot ids, only the slots with those ids are used.
pub fn discover(
    module: &Pkcs11ModuleConfig
) -> SignerResult<Vec<DiscoveredToken>> {
    let context = Pkcs11Context::get_or_load(&module.library)?;
    let slots = context.pkcs11().get_slots_with_token()?;

    let mut res = Vec::new();
    for (index, slot) in slots.into_iter().enumerate() {
        if !module.slot_ids.is_empty() && !module.slot_ids.contains(&slot.id())
        {
            debug!(
                "[{}] Skipping slot {} not in configured slot ids",
                module.uid, slot.id()
            );
            continue
        }
        let token_info = context.pkcs11().get_token_info(slot)?;
        let info = token_from_device(module, index as u64, &token_info);
        info!(
            "[{}] Found token '{}' in slot {}",
            module.uid, info.id, slot.id()
        );
        res.push(DiscoveredToken { info, slot, context: context.clone() });
    }
    Ok(res)
}

/// Builds the registry entry for a token found in a slot.
pub fn token_from_device(
    module: &Pkcs11ModuleConfig,
    slot_index: u64,
    device: &cryptoki::slot::TokenInfo,
) -> TokenInfo {
    let serial = device.serial_number().trim();
    let label = device.label().trim();
    let id = format_token_id(
        &module.token_id_format, &module.uid, slot_index, serial, label
    );

    let mut token = TokenInfo::new(id, TokenKind::Hardware);
    token.module_uid = Some(module.uid.clone());
    token.slot_index = Some(slot_index);
    token.serial_number = Some(serial.to_string());
    token.label = Some(label.to_string());
    token.read_only = module.read_only || device.write_protected();
    token.batch_signing_enabled = module.batch_signing_enabled;
    token.pin_verification_per_signing = module.sign_verify_pin;
    token.available = true;
    token.status = device_status(device).unwrap_or(TokenStatus::Ok);
    token.device_info = device_info(slot_index, device);
    token
}

/// Returns the status the device reports through its token flags.
///
/// Returns `None` if the flags report nothing unusual.
pub fn device_status(
    device: &cryptoki::slot::TokenInfo
) -> Option<TokenStatus> {
    if !device.token_initialized() {
        Some(TokenStatus::NotInitialized)
    }
    else if device.user_pin_locked() {
        Some(TokenStatus::UserPinLocked)
    }
    else if device.user_pin_final_try() {
        Some(TokenStatus::UserPinFinalTry)
    }
    else if device.user_pin_count_low() {
        Some(TokenStatus::UserPinCountLow)
    }
    else {
        None
    }
}

fn device_info(
    slot_index: u64, device: &cryptoki::slot::TokenInfo
) -> BTreeMap<String, String> {
    let mut res = BTreeMap::new();
    res.insert("slot_index".into(), slot_index.to_string());
    res.insert("label".into(), device.label().trim().into());
    res.insert("serial_number".into(), device.serial_number().trim().into());
    res.insert(
        "manufacturer_id".into(), device.manufacturer_id().trim().into()
    );
    res.insert("model".into(), device.model().trim().into());
    res.insert(
        "write_protected".into(), device.write_protected().to_string()
    );
    res
}


//------------ Token Identifiers ---------------------------------------------

/// Creates a token id from the format configured for a module.
///
/// The placeholders `{moduleType}`, `{slotIndex}`, `{serialNumber}` and
/// `{label}` are replaced by the module uid, the index of the slot and
/// the serial number and label reported by the token. Anything else in
/// the format is kept as is.
pub fn format_token_id(
    format: &str,
    module_uid: &str,
    slot_index: u64,
    serial_number: &str,
    label: &str,
) -> String {
    format
        .replace("{moduleType}", module_uid)
        .replace("{slotIndex}", &slot_index.to_string())
        .replace("{serialNumber}", serial_number.trim())
        .replace("{label}", label.trim())
        .trim()
        .to_string()
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_TOKEN_ID_FORMAT;

    #[test]
    fn default_format_joins_all_parts() {
        assert_eq!(
            format_token_id(
                DEFAULT_TOKEN_ID_FORMAT, "softhsm", 0, "5f3e12", "signing "
            ),
            "softhsm05f3e12signing"
        );
    }

    #[test]
    fn custom_format_keeps_literals() {
        assert_eq!(
            format_token_id(
                "{moduleType}-{slotIndex}-{label}", "luna", 3, "", "prod"
            ),
            "luna-3-prod"
        );
        assert_eq!(
            format_token_id("{serialNumber}", "luna", 3, " 0042 ", "prod"),
            "0042"
        );
        assert_eq!(
            format_token_id("fixed", "luna", 3, "0042", "prod"),
            "fixed"
        );
    }

    #[test]
    fn different_slots_get_different_ids() {
        let a = format_token_id("{moduleType}{slotIndex}", "m", 0, "", "");
        let b = format_token_id("{moduleType}{slotIndex}", "m", 1, "", "");
        assert_ne!(a, b);
    }
}
