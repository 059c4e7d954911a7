//! Integration tests for weatherflow-common library.

use weatherflow_common::{
    Command, LogFormat, LoggingConfig, Message, decode_message, encode_command, redact,
};

#[test]
fn test_feed_session_frames() {
    // A typical sequence of frames after connecting and subscribing one device.
    let frames = [
        r#"{"type":"connection_opened"}"#,
        r#"{"type":"ack","id":"42-listen_start"}"#,
        r#"{"type":"rapid_wind","device_id":42,"ob":[1700000003,1.9,270]}"#,
        r#"{"type":"obs_st","device_id":42,"source":"cache","obs":[[1700000000,1.2,2.0,3.1,90,3,1000.1,null,61.5,12000,2.5,100,0.1,1,0,0,2.6,1,1.4,0,0,0]]}"#,
        r#"{"type":"evt_precip","device_id":42,"evt":[1700000010]}"#,
        r#"{"type":"device_status","device_id":42}"#,
    ];

    let decoded: Vec<Message> = frames
        .iter()
        .map(|f| decode_message(f).expect("frame should decode"))
        .collect();

    let kinds: Vec<&str> = decoded.iter().map(Message::kind).collect();
    assert_eq!(
        kinds,
        [
            "connection_opened",
            "ack",
            "rapid_wind",
            "obs_st",
            "evt_precip",
            "unknown"
        ]
    );

    let Message::ObsSt(obs) = &decoded[3] else {
        panic!("expected obs_st");
    };
    let record = obs.latest().expect("record");
    assert_eq!(record.air_temperature, None);
    assert_eq!(record.relative_humidity, Some(61.5));
    assert_eq!(record.solar_radiation, 100.0);
    assert_eq!(record.precipitation_type, 1.0);
}

#[test]
fn test_listen_commands_roundtrip_through_json() {
    let commands = [
        Command::ListenStart {
            device_id: 42,
            id: "a".to_string(),
        },
        Command::ListenRapidStart {
            device_id: 42,
            id: "b".to_string(),
        },
    ];

    for command in &commands {
        let frame = encode_command(command).unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["device_id"], 42);
        assert!(value["type"].as_str().unwrap().starts_with("listen_"));
    }
}

#[test]
fn test_logging_config_parse() {
    #[derive(serde::Deserialize)]
    struct Config {
        logging: LoggingConfig,
    }

    let config: Config = serde_json::from_str(r#"{"logging": {"format": "json"}}"#).unwrap();
    assert_eq!(config.logging.format, LogFormat::Json);
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_token_never_displayed_in_full() {
    let token = "b3a1f9d2-7c44-4e1e-9a63-5d0f2c8e9b71";
    let shown = redact(token).to_string();

    assert!(!shown.contains(token));
    assert!(shown.starts_with("b3a1f9d2"));
}
