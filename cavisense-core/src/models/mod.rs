pub mod sensor;

pub use sensor::{
    format_received_at, SensorEnvelope, SensorPayload, RECEIVED_AT_FIELD, SENSOR_UPDATE_TYPE,
};
