//! Diameter dictionary
//!
//! A [`Dictionary`] knows the applications, commands and AVP names a peer
//! understands, and the per-command AVP rules used to validate messages.
//! It is built once, never mutated afterwards, and shared by reference
//! (`Arc<Dictionary>`) with every connection that needs it.
//!
//! The base application (id 0) is always present. Further applications are
//! described in YAML:
//!
//! ```yaml
//! avps:
//!   - { name: My-Avp, code: 5000, vendor_id: 10415 }
//! applications:
//!   - id: 999
//!     type: acct
//!     name: Hello
//!     commands:
//!       - code: 111
//!         short: HM
//!         name: Hello-Message
//!         request:
//!           - { avp: Session-Id, required: true, max: 1 }
//!         answer:
//!           - { avp: Result-Code, required: true, max: 1 }
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::common::avp_code;
use crate::error::{DiameterError, DiameterResult};
use crate::message::{base_cmd, CommandId, DiameterMessage, BASE_APPLICATION_ID};

/// The hello application (id 999, command 111) and base accounting
/// (id 3, command 271) used by the hello client
pub const HELLO_DICTIONARY: &str = include_str!("../dict/hello.yaml");

/// Application kind, as advertised in CER/CEA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationKind {
    Base,
    Auth,
    Acct,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AvpDef {
    pub name: String,
    pub code: u32,
    #[serde(default)]
    pub vendor_id: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AvpRule {
    pub avp: String,
    #[serde(default)]
    pub required: bool,
    /// Maximum occurrences; unbounded when absent
    #[serde(default)]
    pub max: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandDef {
    pub code: u32,
    /// Short name, e.g. `HM`; `HMR` and `HMA` name the two directions
    pub short: String,
    pub name: String,
    #[serde(default)]
    pub request: Vec<AvpRule>,
    #[serde(default)]
    pub answer: Vec<AvpRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationDef {
    pub id: u32,
    #[serde(rename = "type")]
    pub kind: ApplicationKind,
    pub name: String,
    #[serde(default)]
    pub commands: Vec<CommandDef>,
}

#[derive(Debug, Default, Deserialize)]
struct DictionaryFile {
    #[serde(default)]
    avps: Vec<AvpDef>,
    #[serde(default)]
    applications: Vec<ApplicationDef>,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    name: String,
    code: u32,
    required: bool,
    max: Option<usize>,
}

#[derive(Debug, Clone)]
struct CompiledCommand {
    short: String,
    name: String,
    request: Vec<CompiledRule>,
    answer: Vec<CompiledRule>,
}

/// Registered application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationInfo {
    pub id: u32,
    pub kind: ApplicationKind,
    pub name: String,
}

/// Immutable command and AVP dictionary
#[derive(Debug, Clone)]
pub struct Dictionary {
    applications: HashMap<u32, ApplicationInfo>,
    commands: HashMap<(u32, u32), CompiledCommand>,
    command_names: HashMap<String, CommandId>,
    avps: HashMap<String, AvpDef>,
}

const BASE_AVPS: &[(&str, u32)] = &[
    ("User-Name", avp_code::USER_NAME),
    ("Host-IP-Address", avp_code::HOST_IP_ADDRESS),
    ("Auth-Application-Id", avp_code::AUTH_APPLICATION_ID),
    ("Acct-Application-Id", avp_code::ACCT_APPLICATION_ID),
    ("Vendor-Specific-Application-Id", avp_code::VENDOR_SPECIFIC_APPLICATION_ID),
    ("Session-Id", avp_code::SESSION_ID),
    ("Origin-Host", avp_code::ORIGIN_HOST),
    ("Supported-Vendor-Id", avp_code::SUPPORTED_VENDOR_ID),
    ("Vendor-Id", avp_code::VENDOR_ID),
    ("Firmware-Revision", avp_code::FIRMWARE_REVISION),
    ("Result-Code", avp_code::RESULT_CODE),
    ("Product-Name", avp_code::PRODUCT_NAME),
    ("Disconnect-Cause", avp_code::DISCONNECT_CAUSE),
    ("Origin-State-Id", avp_code::ORIGIN_STATE_ID),
    ("Failed-AVP", avp_code::FAILED_AVP),
    ("Error-Message", avp_code::ERROR_MESSAGE),
    ("Destination-Realm", avp_code::DESTINATION_REALM),
    ("Destination-Host", avp_code::DESTINATION_HOST),
    ("Origin-Realm", avp_code::ORIGIN_REALM),
    ("Inband-Security-Id", avp_code::INBAND_SECURITY_ID),
    ("Accounting-Record-Type", avp_code::ACCOUNTING_RECORD_TYPE),
    ("Accounting-Record-Number", avp_code::ACCOUNTING_RECORD_NUMBER),
];

fn one(avp: &str) -> AvpRule {
    AvpRule {
        avp: avp.to_string(),
        required: true,
        max: Some(1),
    }
}

fn at_least_one(avp: &str) -> AvpRule {
    AvpRule {
        avp: avp.to_string(),
        required: true,
        max: None,
    }
}

fn base_application() -> ApplicationDef {
    let answer = || vec![one("Result-Code"), one("Origin-Host"), one("Origin-Realm")];
    ApplicationDef {
        id: BASE_APPLICATION_ID,
        kind: ApplicationKind::Base,
        name: "Base".to_string(),
        commands: vec![
            CommandDef {
                code: base_cmd::CAPABILITIES_EXCHANGE,
                short: "CE".to_string(),
                name: "Capabilities-Exchange".to_string(),
                request: vec![
                    one("Origin-Host"),
                    one("Origin-Realm"),
                    at_least_one("Host-IP-Address"),
                    one("Vendor-Id"),
                    one("Product-Name"),
                ],
                answer: answer(),
            },
            CommandDef {
                code: base_cmd::DEVICE_WATCHDOG,
                short: "DW".to_string(),
                name: "Device-Watchdog".to_string(),
                request: vec![one("Origin-Host"), one("Origin-Realm")],
                answer: answer(),
            },
            CommandDef {
                code: base_cmd::DISCONNECT_PEER,
                short: "DP".to_string(),
                name: "Disconnect-Peer".to_string(),
                request: vec![one("Origin-Host"), one("Origin-Realm"), one("Disconnect-Cause")],
                answer: answer(),
            },
        ],
    }
}

impl Dictionary {
    /// Dictionary holding only the base protocol
    pub fn base() -> Self {
        let mut dict = Self {
            applications: HashMap::new(),
            commands: HashMap::new(),
            command_names: HashMap::new(),
            avps: BASE_AVPS
                .iter()
                .map(|(name, code)| {
                    let def = AvpDef {
                        name: name.to_string(),
                        code: *code,
                        vendor_id: None,
                    };
                    (name.to_string(), def)
                })
                .collect(),
        };
        // Every base rule names an AVP from BASE_AVPS
        if let Err(e) = dict.add_application(base_application()) {
            log::error!("Base dictionary is inconsistent: {e}");
        }
        dict
    }

    /// Base protocol plus the applications described by `yaml`
    pub fn from_yaml_str(yaml: &str) -> DiameterResult<Self> {
        let file: DictionaryFile = serde_yaml::from_str(yaml)
            .map_err(|e| DiameterError::Protocol(format!("invalid dictionary: {e}")))?;

        let mut dict = Self::base();
        for avp in file.avps {
            if let Some(existing) = dict.avps.get(&avp.name) {
                if existing.code != avp.code {
                    return Err(DiameterError::Protocol(format!(
                        "AVP {} redefined with code {} (was {})",
                        avp.name, avp.code, existing.code
                    )));
                }
            }
            dict.avps.insert(avp.name.clone(), avp);
        }
        for app in file.applications {
            dict.add_application(app)?;
        }
        Ok(dict)
    }

    /// Load a YAML dictionary file on top of the base protocol
    pub fn from_file(path: impl AsRef<Path>) -> DiameterResult<Self> {
        let yaml = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&yaml)
    }

    fn compile_rules(&self, command: &str, rules: &[AvpRule]) -> DiameterResult<Vec<CompiledRule>> {
        rules
            .iter()
            .map(|rule| {
                let def = self.avps.get(&rule.avp).ok_or_else(|| {
                    DiameterError::Protocol(format!(
                        "command {command} references unknown AVP {}",
                        rule.avp
                    ))
                })?;
                Ok(CompiledRule {
                    name: def.name.clone(),
                    code: def.code,
                    required: rule.required,
                    max: rule.max,
                })
            })
            .collect()
    }

    fn add_application(&mut self, app: ApplicationDef) -> DiameterResult<()> {
        if self.applications.contains_key(&app.id) {
            return Err(DiameterError::Protocol(format!(
                "application {} defined twice",
                app.id
            )));
        }

        for command in &app.commands {
            let compiled = CompiledCommand {
                short: command.short.clone(),
                name: command.name.clone(),
                request: self.compile_rules(&command.name, &command.request)?,
                answer: self.compile_rules(&command.name, &command.answer)?,
            };
            self.command_names.insert(
                format!("{}R", command.short),
                CommandId::request(app.id, command.code),
            );
            self.command_names.insert(
                format!("{}A", command.short),
                CommandId::answer(app.id, command.code),
            );
            self.commands.insert((app.id, command.code), compiled);
        }

        log::debug!(
            "Dictionary: application {} ({}) with {} command(s)",
            app.id,
            app.name,
            app.commands.len()
        );
        self.applications.insert(
            app.id,
            ApplicationInfo {
                id: app.id,
                kind: app.kind,
                name: app.name,
            },
        );
        Ok(())
    }

    /// Resolve a short command name such as `HMA` or `CER`
    pub fn command_id(&self, name: &str) -> Option<CommandId> {
        self.command_names.get(name).copied()
    }

    /// Short name of a command direction, e.g. `DWA`
    pub fn command_name(&self, id: CommandId) -> Option<String> {
        self.commands
            .get(&(id.application_id, id.command_code))
            .map(|c| format!("{}{}", c.short, if id.request { "R" } else { "A" }))
    }

    /// Long name of a command, e.g. `Device-Watchdog`
    pub fn command_long_name(&self, id: CommandId) -> Option<&str> {
        self.commands
            .get(&(id.application_id, id.command_code))
            .map(|c| c.name.as_str())
    }

    pub fn application(&self, id: u32) -> Option<&ApplicationInfo> {
        self.applications.get(&id)
    }

    pub fn avp_code(&self, name: &str) -> Option<u32> {
        self.avps.get(name).map(|def| def.code)
    }

    /// Check a message against its command's AVP rules.
    ///
    /// Answers with the E bit set only carry the AVPs the sender could
    /// produce and are exempt.
    pub fn validate(&self, msg: &DiameterMessage) -> DiameterResult<()> {
        let header = &msg.header;
        if !self.applications.contains_key(&header.application_id) {
            return Err(DiameterError::UnknownApplication(header.application_id));
        }
        let command = self
            .commands
            .get(&(header.application_id, header.command_code))
            .ok_or(DiameterError::UnknownCommand(header.command_code))?;

        if header.is_answer() && header.is_error() {
            return Ok(());
        }

        let rules = if header.is_request() {
            &command.request
        } else {
            &command.answer
        };
        for rule in rules {
            let count = msg.find_all_avps(rule.code).count();
            if rule.required && count == 0 {
                return Err(DiameterError::MissingAvp(rule.name.clone()));
            }
            if let Some(max) = rule.max {
                if count > max {
                    return Err(DiameterError::InvalidMessage(format!(
                        "{} occurs {count} times in {}, at most {max} allowed",
                        rule.name, command.name
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::base()
    }
}
