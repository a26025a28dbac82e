//! Command codec: (component, action, version) to opcode byte, and the
//! payload each action carries.
//!
//! Opcodes are a contract between client and agent builds and never change.
//! The table below is laid out as `0x80 | component << 3 | slot` with the
//! action slots
//!
//! | slot | action                  | payload                 |
//! |------|-------------------------|-------------------------|
//! | 0    | status                  | none                    |
//! | 1    | install                 | none                    |
//! | 2    | install with a version  | version string          |
//! | 3    | uninstall               | none                    |
//! | 4    | start                   | none                    |
//! | 5    | stop                    | none                    |
//! | 6    | restart                 | none                    |
//! | 7    | configure               | `name=value` string     |

use std::fmt;
use std::str::FromStr;

use chainerror::*;

use crate::connection::{Connection, FlushStatus};
use crate::error::*;
use crate::protocol::FrameReader;

/// Separates name and value in a configure payload.
pub const CONFIG_SEPARATOR: char = '=';

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Component {
    Hadoop,
    Zookeeper,
    Hbase,
    Hive,
    Spark,
    Flink,
    Kafka,
    Presto,
}

impl Component {
    pub const ALL: [Component; 8] = [
        Component::Hadoop,
        Component::Zookeeper,
        Component::Hbase,
        Component::Hive,
        Component::Spark,
        Component::Flink,
        Component::Kafka,
        Component::Presto,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Component::Hadoop => "hadoop",
            Component::Zookeeper => "zookeeper",
            Component::Hbase => "hbase",
            Component::Hive => "hive",
            Component::Spark => "spark",
            Component::Flink => "flink",
            Component::Kafka => "kafka",
            Component::Presto => "presto",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Component {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Component::ALL
            .iter()
            .copied()
            .find(|c| c.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| cherr!(ErrorKind::InvalidParameter(s.to_string())))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    /// No action: report status.
    Status,
    Install,
    Uninstall,
    Start,
    Stop,
    Restart,
    Configure,
}

impl Action {
    pub const ALL: [Action; 7] = [
        Action::Status,
        Action::Install,
        Action::Uninstall,
        Action::Start,
        Action::Stop,
        Action::Restart,
        Action::Configure,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Action::Status => "status",
            Action::Install => "install",
            Action::Uninstall => "uninstall",
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Restart => "restart",
            Action::Configure => "configure",
        }
    }

    fn slot(self, with_version: bool) -> usize {
        match self {
            Action::Status => 0,
            Action::Install if with_version => 2,
            Action::Install => 1,
            Action::Uninstall => 3,
            Action::Start => 4,
            Action::Stop => 5,
            Action::Restart => 6,
            Action::Configure => 7,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Action::ALL
            .iter()
            .copied()
            .find(|a| a.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| cherr!(ErrorKind::InvalidParameter(s.to_string())))
    }
}

// [component][slot]
static OPCODES: [[u8; 8]; 8] = [
    [0x80, 0x81, 0x82, 0x83, 0x84, 0x85, 0x86, 0x87], // hadoop
    [0x88, 0x89, 0x8a, 0x8b, 0x8c, 0x8d, 0x8e, 0x8f], // zookeeper
    [0x90, 0x91, 0x92, 0x93, 0x94, 0x95, 0x96, 0x97], // hbase
    [0x98, 0x99, 0x9a, 0x9b, 0x9c, 0x9d, 0x9e, 0x9f], // hive
    [0xa0, 0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7], // spark
    [0xa8, 0xa9, 0xaa, 0xab, 0xac, 0xad, 0xae, 0xaf], // flink
    [0xb0, 0xb1, 0xb2, 0xb3, 0xb4, 0xb5, 0xb6, 0xb7], // kafka
    [0xb8, 0xb9, 0xba, 0xbb, 0xbc, 0xbd, 0xbe, 0xbf], // presto
];

/// Opcode for `action` on `component`.
///
/// Only [`Action::Install`] looks at `version`: a non-empty one selects the
/// versioned install opcode.
pub fn get_protocol_code(component: Component, action: Action, version: &str) -> u8 {
    let with_version = action == Action::Install && !version.is_empty();
    OPCODES[component.index()][action.slot(with_version)]
}

/// Inverse of [`get_protocol_code`]: the component, the action and whether
/// a version string follows.
pub fn decode_protocol_code(opcode: u8) -> Option<(Component, Action, bool)> {
    if opcode & 0x80 == 0 {
        return None;
    }
    let component = *Component::ALL.get(usize::from((opcode >> 3) & 0x0f))?;
    let action = match opcode & 0x07 {
        0 => Action::Status,
        1 | 2 => Action::Install,
        3 => Action::Uninstall,
        4 => Action::Start,
        5 => Action::Stop,
        6 => Action::Restart,
        _ => Action::Configure,
    };
    Some((component, action, opcode & 0x07 == 2))
}

/// One request to the agent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandRequest {
    pub component: Component,
    pub action: Action,
    /// Install only.
    pub version: Option<String>,
    /// Configure only.
    pub name: Option<String>,
    /// Configure only.
    pub value: Option<String>,
}

impl CommandRequest {
    pub fn new(component: Component, action: Action) -> Self {
        CommandRequest {
            component,
            action,
            version: None,
            name: None,
            value: None,
        }
    }

    pub fn install(component: Component, version: Option<&str>) -> Self {
        CommandRequest {
            version: version.map(str::to_string),
            ..CommandRequest::new(component, Action::Install)
        }
    }

    pub fn configure(component: Component, name: &str, value: &str) -> Self {
        CommandRequest {
            name: Some(name.to_string()),
            value: Some(value.to_string()),
            ..CommandRequest::new(component, Action::Configure)
        }
    }

    pub fn opcode(&self) -> u8 {
        get_protocol_code(
            self.component,
            self.action,
            self.version.as_deref().unwrap_or(""),
        )
    }

    fn payload(&self) -> Result<Option<String>> {
        match self.action {
            Action::Install => Ok(self.version.clone().filter(|v| !v.is_empty())),
            Action::Configure => match (self.name.as_deref(), self.value.as_deref()) {
                (Some(name), Some(value)) if !name.is_empty() => {
                    if name.contains(CONFIG_SEPARATOR) {
                        return Err(cherr!(ErrorKind::InvalidParameter(name.to_string())));
                    }
                    Ok(Some(format!("{}{}{}", name, CONFIG_SEPARATOR, value)))
                }
                _ => Err(cherr!(ErrorKind::InvalidParameter(
                    "configure needs a name and a value".to_string()
                ))),
            },
            _ => Ok(None),
        }
    }

    /// Frame the request on `conn` and flush it.
    pub fn encode(&self, conn: &mut Connection) -> Result<FlushStatus> {
        let payload = self.payload()?;
        conn.begin_message(Some(self.opcode()))?;
        if let Some(payload) = payload {
            conn.put_string(&payload)?;
        }
        conn.end_message()?;
        conn.flush()
    }

    /// Rebuild a request from a command frame.
    pub fn decode(opcode: u8, payload: &[u8]) -> std::result::Result<Self, String> {
        let (component, action, with_version) = decode_protocol_code(opcode)
            .ok_or_else(|| format!("unknown opcode 0x{:02x}", opcode))?;
        let mut request = CommandRequest::new(component, action);
        let mut reader = FrameReader::new(payload);

        if with_version || action == Action::Configure {
            let text = reader
                .read_string()
                .ok_or_else(|| format!("missing payload for {} {}", action, component))?;
            if with_version {
                request.version = Some(text);
            } else {
                let (name, value) = text
                    .split_once(CONFIG_SEPARATOR)
                    .ok_or_else(|| format!("malformed setting \"{}\"", text))?;
                request.name = Some(name.to_string());
                request.value = Some(value.to_string());
            }
        }
        if !reader.is_empty() {
            return Err(format!("unexpected payload for {} {}", action, component));
        }
        Ok(request)
    }
}

impl fmt::Display for CommandRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action, self.component)?;
        if let Some(version) = &self.version {
            write!(f, " {}", version)?;
        }
        if let (Some(name), Some(value)) = (&self.name, &self.value) {
            write!(f, " {}{}{}", name, CONFIG_SEPARATOR, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn install_version_selects_opcode() {
        for c in Component::ALL {
            assert_ne!(
                get_protocol_code(c, Action::Install, "1.2.3"),
                get_protocol_code(c, Action::Install, "")
            );
            assert_eq!(
                get_protocol_code(c, Action::Status, "1.2.3"),
                get_protocol_code(c, Action::Status, "")
            );
        }
        assert_eq!(get_protocol_code(Component::Kafka, Action::Install, "3.6"), 0xb2);
        assert_eq!(get_protocol_code(Component::Hadoop, Action::Status, ""), 0x80);
        assert_eq!(get_protocol_code(Component::Presto, Action::Configure, ""), 0xbf);
    }

    #[test]
    fn table_matches_layout() {
        let mut seen = HashSet::new();
        for (ci, row) in OPCODES.iter().enumerate() {
            for (slot, &op) in row.iter().enumerate() {
                assert_eq!(op, 0x80 | (ci as u8) << 3 | slot as u8);
                assert!(seen.insert(op));
                let (c, _, _) = decode_protocol_code(op).unwrap();
                assert_eq!(c.index(), ci);
            }
        }
        assert_eq!(decode_protocol_code(b'C'), None);
        assert_eq!(decode_protocol_code(0xc0), None);
    }

    #[test]
    fn decode_round_trip() {
        let request = CommandRequest::configure(Component::Hive, "heap", "4g=max");
        let payload = request.payload().unwrap().unwrap();
        let mut bytes = payload.into_bytes();
        bytes.push(0);
        assert_eq!(CommandRequest::decode(request.opcode(), &bytes), Ok(request.clone()));

        let request = CommandRequest::install(Component::Spark, Some("3.5.1"));
        assert_eq!(
            CommandRequest::decode(request.opcode(), b"3.5.1\0"),
            Ok(request.clone())
        );

        let request = CommandRequest::new(Component::Flink, Action::Restart);
        assert_eq!(CommandRequest::decode(request.opcode(), b""), Ok(request.clone()));
        assert!(CommandRequest::decode(request.opcode(), b"x\0").is_err());
    }

    #[test]
    fn configure_needs_name_and_value() {
        let mut request = CommandRequest::configure(Component::Kafka, "a=b", "c");
        assert!(request.payload().is_err());
        request.name = None;
        assert!(request.payload().is_err());
        assert!(CommandRequest::decode(0x8f, b"novalue\0").is_err());
    }

    #[test]
    fn frames_on_connection() {
        let mut conn = Connection::new();
        let request = CommandRequest::install(Component::Zookeeper, Some("3.8"));
        // no transport: framing succeeds, the flush does not
        assert!(request.encode(&mut conn).is_err());
        assert_eq!(
            conn.pending_output(),
            &[0x8a, 0, 0, 0, 8, b'3', b'.', b'8', 0]
        );
    }

    #[test]
    fn names() {
        assert_eq!("HBase".parse::<Component>().unwrap(), Component::Hbase);
        assert_eq!("stop".parse::<Action>().unwrap(), Action::Stop);
        assert!("yarn".parse::<Component>().is_err());
        assert_eq!(
            CommandRequest::install(Component::Hadoop, Some("3.3")).to_string(),
            "install hadoop 3.3"
        );
    }
}
