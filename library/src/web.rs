//! Browser implementation of [NegotiationEngine] on top of `RTCPeerConnection`.

use async_trait::async_trait;
use js_sys::{Array, Object, Reflect};
use wasm_bindgen::JsValue;
use wasm_bindgen_futures::JsFuture;
use web_sys::{RtcConfiguration, RtcIceCandidateInit, RtcPeerConnection};
use web_sys::{RtcSdpType, RtcSessionDescriptionInit};

use call_relay_protocol::IceCandidate;

use crate::engine::{NegotiationEngine, NegotiationError, SdpKind};

/// Specifies what kind of peer connection to create
#[derive(Debug, Clone)]
pub enum ConnectionType {
    /// Within local network
    Local,
    /// Setup with STUN server, WAN capabilities but can fail
    Stun { host: String },
    /// Setup with STUN and TURN hosts and fallback to TURN if needed, most stable connection
    StunAndTurn {
        host: String,
        username: String,
        credential: String,
    },
}

impl ConnectionType {
    pub(crate) fn create_peer_connection(&self) -> Result<RtcPeerConnection, JsValue> {
        use ConnectionType::{Local, Stun, StunAndTurn};
        let ice_servers = Array::new();
        match self {
            Local => return RtcPeerConnection::new(),
            Stun { host } => {
                ice_servers.push(&ice_server("stun:", host, None)?);
            }
            StunAndTurn {
                host,
                username,
                credential,
            } => {
                ice_servers.push(&ice_server("stun:", host, None)?);
                ice_servers.push(&ice_server("turn:", host, Some((username, credential)))?);
            }
        }
        let mut rtc_configuration = RtcConfiguration::new();
        rtc_configuration.ice_servers(&ice_servers);
        RtcPeerConnection::new_with_configuration(&rtc_configuration)
    }
}

fn ice_server(
    scheme: &str,
    host: &str,
    credentials: Option<(&String, &String)>,
) -> Result<Object, JsValue> {
    let entry = Object::new();
    // NOTE: it's plural, but also accepts unique string
    let url = scheme.to_owned() + host;
    Reflect::set(&entry, &"urls".into(), &url.into())?;
    if let Some((username, credential)) = credentials {
        Reflect::set(&entry, &"username".into(), &username.into())?;
        Reflect::set(&entry, &"credential".into(), &credential.into())?;
    }
    Ok(entry)
}

/// Route `log` records to the browser console.
pub fn init_logging() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
    wasm_logger::init(wasm_logger::Config::default());
}

fn js_error(operation: &'static str) -> impl Fn(JsValue) -> NegotiationError {
    move |error| {
        let reason = error
            .as_string()
            .unwrap_or_else(|| format!("{error:?}"));
        NegotiationError::new(operation, reason)
    }
}

fn sdp_type(kind: SdpKind) -> RtcSdpType {
    match kind {
        SdpKind::Offer => RtcSdpType::Offer,
        SdpKind::Answer => RtcSdpType::Answer,
    }
}

/// Negotiation engine backed by the browser's WebRTC stack.
pub struct WebRtcEngine {
    peer_connection: RtcPeerConnection,
}

impl WebRtcEngine {
    pub fn new(connection_type: &ConnectionType) -> Result<Self, NegotiationError> {
        let peer_connection = connection_type
            .create_peer_connection()
            .map_err(js_error("create peer connection"))?;
        Ok(WebRtcEngine { peer_connection })
    }

    /// The underlying connection, to attach tracks and event handlers.
    pub fn peer_connection(&self) -> &RtcPeerConnection {
        &self.peer_connection
    }

    async fn create(&self, operation: &'static str, offer: bool) -> Result<String, NegotiationError> {
        let promise = if offer {
            self.peer_connection.create_offer()
        } else {
            self.peer_connection.create_answer()
        };
        let description = JsFuture::from(promise).await.map_err(js_error(operation))?;
        Reflect::get(&description, &JsValue::from_str("sdp"))
            .map_err(js_error(operation))?
            .as_string()
            .ok_or_else(|| NegotiationError::new(operation, "description without sdp"))
    }
}

#[async_trait(?Send)]
impl NegotiationEngine for WebRtcEngine {
    async fn create_offer(&mut self) -> Result<String, NegotiationError> {
        self.create("create_offer", true).await
    }

    async fn create_answer(&mut self) -> Result<String, NegotiationError> {
        self.create("create_answer", false).await
    }

    async fn set_local_description(
        &mut self,
        kind: SdpKind,
        sdp: String,
    ) -> Result<(), NegotiationError> {
        let mut description = RtcSessionDescriptionInit::new(sdp_type(kind));
        description.sdp(&sdp);
        JsFuture::from(self.peer_connection.set_local_description(&description))
            .await
            .map_err(js_error("set_local_description"))?;
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        kind: SdpKind,
        sdp: String,
    ) -> Result<(), NegotiationError> {
        let mut description = RtcSessionDescriptionInit::new(sdp_type(kind));
        description.sdp(&sdp);
        JsFuture::from(self.peer_connection.set_remote_description(&description))
            .await
            .map_err(js_error("set_remote_description"))?;
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let mut init = RtcIceCandidateInit::new(&candidate.candidate);
        init.sdp_mid(candidate.sdp_mid.as_deref());
        init.sdp_m_line_index(candidate.sdp_m_line_index);
        JsFuture::from(
            self.peer_connection
                .add_ice_candidate_with_opt_rtc_ice_candidate_init(Some(&init)),
        )
        .await
        .map_err(js_error("add_ice_candidate"))?;
        Ok(())
    }
}
