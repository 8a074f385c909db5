use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

pub type UserId = u64;
pub type GroupId = u64;

/// Command codes carried in the `cmd` field of every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Heartbeat,
    PrivateMessage,
    GroupMessage,
    Ack,
    PrivateCallOffer,
    PrivateCallAnswer,
    PrivateCallIce,
    GroupCallOffer,
    GroupCallAnswer,
    GroupCallIce,
    CallInvitation,
    GroupAck,
    Remind,
}

impl Command {
    pub fn from_code(code: i32) -> Option<Self> {
        let cmd = match code {
            0 => Command::Heartbeat,
            1 => Command::PrivateMessage,
            2 => Command::GroupMessage,
            3 => Command::Ack,
            4 => Command::PrivateCallOffer,
            5 => Command::PrivateCallAnswer,
            6 => Command::PrivateCallIce,
            7 => Command::GroupCallOffer,
            8 => Command::GroupCallAnswer,
            9 => Command::GroupCallIce,
            10 => Command::CallInvitation,
            11 => Command::GroupAck,
            100 => Command::Remind,
            _ => return None,
        };
        Some(cmd)
    }

    pub fn code(self) -> i32 {
        match self {
            Command::Heartbeat => 0,
            Command::PrivateMessage => 1,
            Command::GroupMessage => 2,
            Command::Ack => 3,
            Command::PrivateCallOffer => 4,
            Command::PrivateCallAnswer => 5,
            Command::PrivateCallIce => 6,
            Command::GroupCallOffer => 7,
            Command::GroupCallAnswer => 8,
            Command::GroupCallIce => 9,
            Command::CallInvitation => 10,
            Command::GroupAck => 11,
            Command::Remind => 100,
        }
    }

    /// Offer/answer/ICE/invitation traffic routed opaquely to the SFU peers.
    pub fn is_call_signal(self) -> bool {
        matches!(
            self,
            Command::PrivateCallOffer
                | Command::PrivateCallAnswer
                | Command::PrivateCallIce
                | Command::GroupCallOffer
                | Command::GroupCallAnswer
                | Command::GroupCallIce
                | Command::CallInvitation
        )
    }
}

/// Wire frame: `{"cmd": <int>, "token": <string?>, "data": <json>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub cmd: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// An envelope after its payload has been decoded for the matching command.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Heartbeat,
    Private(PrivateMessage),
    Group(GroupMessage),
    Ack(Ack),
    CallSignal(Command, CallRoute),
    /// Known code with no inbound meaning (group ack, remind).
    Reserved(Command),
    Unknown(i32),
}

impl Envelope {
    pub fn new<T: Serialize>(cmd: Command, data: &T) -> serde_json::Result<Self> {
        Ok(Self {
            cmd: cmd.code(),
            token: None,
            data: serde_json::to_value(data)?,
        })
    }

    pub fn decode(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn command(&self) -> Option<Command> {
        Command::from_code(self.cmd)
    }

    /// Decodes `data` into the payload type of this envelope's command.
    /// Unknown codes are not an error.
    pub fn inbound(&self) -> serde_json::Result<Inbound> {
        let Some(cmd) = self.command() else {
            return Ok(Inbound::Unknown(self.cmd));
        };
        let inbound = match cmd {
            Command::Heartbeat => Inbound::Heartbeat,
            Command::PrivateMessage => Inbound::Private(self.payload()?),
            Command::GroupMessage => Inbound::Group(self.payload()?),
            Command::Ack => Inbound::Ack(self.payload()?),
            Command::GroupAck | Command::Remind => Inbound::Reserved(cmd),
            signal => Inbound::CallSignal(signal, self.payload()?),
        };
        Ok(inbound)
    }

    fn payload<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.data.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivateMessage {
    #[serde(default)]
    pub seq_id: String,
    #[serde(default)]
    pub sender_id: UserId,
    #[serde(default)]
    pub receiver_id: UserId,
    #[serde(default)]
    pub content: String,
    /// 0 text, 1 image, 2 file, 3 voice, 4 video
    #[serde(rename = "type", default)]
    pub msg_type: i32,
    #[serde(default)]
    pub send_time: i64,
    #[serde(default)]
    pub sender_nickname: String,
    #[serde(default)]
    pub sender_avatar: String,
}

/// Group traffic; `receiver_id` is the group id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMessage {
    #[serde(default)]
    pub seq_id: String,
    #[serde(default)]
    pub sender_id: UserId,
    #[serde(default)]
    pub receiver_id: GroupId,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type", default)]
    pub msg_type: i32,
    #[serde(default)]
    pub send_time: i64,
    #[serde(default)]
    pub sender_nickname: String,
    #[serde(default)]
    pub sender_avatar: String,
    #[serde(default)]
    pub group_name: String,
    #[serde(default)]
    pub group_avatar: String,
}

/// For private acks `receiver_id` is the original sender; for group acks
/// `sender_id` is the acking member and `receiver_id` the group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ack {
    pub seq_id: String,
    #[serde(default)]
    pub sender_id: UserId,
    #[serde(default)]
    pub receiver_id: UserId,
    #[serde(default)]
    pub is_group: bool,
}

/// Routing fields of a call-signaling payload. Everything else stays opaque.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CallRoute {
    #[serde(default)]
    pub sender_id: UserId,
    #[serde(default)]
    pub receiver_id: Option<UserId>,
    #[serde(default)]
    pub receiver_id_list: Vec<UserId>,
}

impl CallRoute {
    pub fn targets(&self) -> Vec<UserId> {
        let mut targets: Vec<UserId> = self.receiver_id.into_iter().filter(|id| *id != 0).collect();
        for id in &self.receiver_id_list {
            if *id != 0 && !targets.contains(id) {
                targets.push(*id);
            }
        }
        targets
    }
}

/// Body of `/submit_offline`: consumed private sequence ids and group acks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OfflineSubmission {
    #[serde(default)]
    pub private: Vec<String>,
    #[serde(default)]
    pub group: Vec<Ack>,
}

/// A persisted group message row; `id` is the storage order.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredGroupMessage {
    pub id: i64,
    pub group_id: GroupId,
    pub seq_id: String,
    pub sender_id: UserId,
    pub content: String,
    pub msg_type: i32,
    pub send_time: i64,
}

impl StoredGroupMessage {
    pub fn from_message(message: &GroupMessage) -> Self {
        Self {
            id: 0,
            group_id: message.receiver_id,
            seq_id: message.seq_id.clone(),
            sender_id: message.sender_id,
            content: message.content.clone(),
            msg_type: message.msg_type,
            send_time: message.send_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UserProfile {
    pub id: UserId,
    pub nickname: String,
    pub avatar: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GroupProfile {
    pub id: GroupId,
    pub name: String,
    pub avatar: String,
}
