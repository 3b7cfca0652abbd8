use crate::error::EngineError;
use crate::types::SweepMode;

/// Queries understood by the analyzer.
///
/// Every query returns ASCII text; numeric ones return comma-separated
/// floats (one value for scalars, one per sweep point for traces).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    Identity,
    Magnitude,
    Phase,
    Frequency,
    Center,
    Span,
    Start,
    Stop,
    ResolutionBandwidth,
    OscillatorAmplitude,
}

impl Query {
    pub fn command(&self) -> &'static str {
        match self {
            Query::Identity => "ID?",
            Query::Magnitude => "A?",
            Query::Phase => "B?",
            Query::Frequency => "X?",
            Query::Center => "CENTER?",
            Query::Span => "SPAN?",
            Query::Start => "START?",
            Query::Stop => "STOP?",
            Query::ResolutionBandwidth => "RBW?",
            Query::OscillatorAmplitude => "OSC1?",
        }
    }

    pub fn from_command(command: &str) -> Option<Query> {
        let query = match command.trim().to_ascii_uppercase().as_str() {
            "ID?" => Query::Identity,
            "A?" => Query::Magnitude,
            "B?" => Query::Phase,
            "X?" => Query::Frequency,
            "CENTER?" => Query::Center,
            "SPAN?" => Query::Span,
            "START?" => Query::Start,
            "STOP?" => Query::Stop,
            "RBW?" => Query::ResolutionBandwidth,
            "OSC1?" => Query::OscillatorAmplitude,
            _ => return None,
        };
        Some(query)
    }
}

/// Fire-and-forget writes. The instrument sends nothing back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SetCommand {
    Center(f64),
    Span(f64),
    Start(f64),
    Stop(f64),
    ResolutionBandwidth(f64),
    OscillatorAmplitude(f64),
    SweepMode(SweepMode),
    Trigger,
}

impl SetCommand {
    pub fn encode(&self) -> String {
        match self {
            SetCommand::Center(hz) => format!("CENTER = {hz} HZ"),
            SetCommand::Span(hz) => format!("SPAN = {hz} HZ"),
            SetCommand::Start(hz) => format!("START = {hz} HZ"),
            SetCommand::Stop(hz) => format!("STOP = {hz} HZ"),
            SetCommand::ResolutionBandwidth(hz) => format!("RBW = {hz} HZ"),
            SetCommand::OscillatorAmplitude(dbm) => format!("OSC1 = {dbm} DBM"),
            SetCommand::SweepMode(SweepMode::Continuous) => "SWM1".to_string(),
            SetCommand::SweepMode(SweepMode::Single) => "SWM2".to_string(),
            SetCommand::Trigger => "SWTRG".to_string(),
        }
    }

    /// Parse an encoded set command back into its typed form
    pub fn parse(command: &str) -> Option<SetCommand> {
        let upper = command.trim().to_ascii_uppercase();
        match upper.as_str() {
            "SWM1" => return Some(SetCommand::SweepMode(SweepMode::Continuous)),
            "SWM2" => return Some(SetCommand::SweepMode(SweepMode::Single)),
            "SWTRG" => return Some(SetCommand::Trigger),
            _ => {}
        }

        let (name, rest) = upper.split_once('=')?;
        let mut parts = rest.split_whitespace();
        let value: f64 = parts.next()?.parse().ok()?;
        let unit = parts.next()?;
        let command = match (name.trim(), unit) {
            ("CENTER", "HZ") => SetCommand::Center(value),
            ("SPAN", "HZ") => SetCommand::Span(value),
            ("START", "HZ") => SetCommand::Start(value),
            ("STOP", "HZ") => SetCommand::Stop(value),
            ("RBW", "HZ") => SetCommand::ResolutionBandwidth(value),
            ("OSC1", "DBM") => SetCommand::OscillatorAmplitude(value),
            _ => return None,
        };
        Some(command)
    }
}

/// String encoding/decoding of analyzer responses
pub struct Protocol;

impl Protocol {
    /// Decode a comma-separated list of floats.
    ///
    /// Fails if the response holds no tokens or any token is not a finite
    /// number. `nan` and `inf` parse as floats but never come from the
    /// instrument.
    pub fn decode_array(command: &str, response: &str) -> Result<Vec<f64>, EngineError> {
        let trimmed = response.trim();
        if trimmed.is_empty() {
            return Err(EngineError::Decode {
                command: command.to_string(),
                reason: "empty response".to_string(),
            });
        }

        trimmed
            .split(',')
            .enumerate()
            .map(|(i, token)| {
                let token = token.trim();
                token
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| EngineError::Decode {
                        command: command.to_string(),
                        reason: format!("token {i} is not a number: '{token}'"),
                    })
            })
            .collect()
    }

    /// Decode a response that must hold exactly one float
    pub fn decode_scalar(command: &str, response: &str) -> Result<f64, EngineError> {
        let values = Self::decode_array(command, response)?;
        match values.as_slice() {
            [value] => Ok(*value),
            _ => Err(EngineError::Decode {
                command: command.to_string(),
                reason: format!("expected a single value, got {}", values.len()),
            }),
        }
    }

    /// First non-empty line of an identity response
    pub fn decode_identity(response: &str) -> Result<String, EngineError> {
        response
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| EngineError::Decode {
                command: Query::Identity.command().to_string(),
                reason: "empty identity response".to_string(),
            })
    }

    /// Inverse of [`Protocol::decode_array`]
    pub fn encode_array(values: &[f64]) -> String {
        values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_command_encoding() {
        assert_eq!(SetCommand::Center(1_000_000.0).encode(), "CENTER = 1000000 HZ");
        assert_eq!(SetCommand::Span(2500.5).encode(), "SPAN = 2500.5 HZ");
        assert_eq!(SetCommand::ResolutionBandwidth(10.0).encode(), "RBW = 10 HZ");
        assert_eq!(SetCommand::OscillatorAmplitude(-7.5).encode(), "OSC1 = -7.5 DBM");
        assert_eq!(SetCommand::SweepMode(SweepMode::Single).encode(), "SWM2");
        assert_eq!(SetCommand::Trigger.encode(), "SWTRG");
    }

    #[test]
    fn test_set_command_parse() {
        assert_eq!(
            SetCommand::parse("CENTER = 1000000 HZ"),
            Some(SetCommand::Center(1_000_000.0))
        );
        assert_eq!(
            SetCommand::parse("osc1 = -10 dbm"),
            Some(SetCommand::OscillatorAmplitude(-10.0))
        );
        assert_eq!(SetCommand::parse("SWM2"), Some(SetCommand::SweepMode(SweepMode::Single)));
        assert_eq!(SetCommand::parse("CENTER = abc HZ"), None);
        assert_eq!(SetCommand::parse("OSC1 = 3 HZ"), None);
    }

    #[test]
    fn test_decode_instrument_format() {
        let values = Protocol::decode_array("A?", " -2.345E+01, -1.0E+01,+3.5\r\n").unwrap();
        assert_eq!(values, vec![-23.45, -10.0, 3.5]);
    }

    #[test]
    fn test_decode_round_trip() {
        let values = vec![1.0e6, -45.678_912_3, 0.000_123_4, 9.87654321e8, 0.0];
        let decoded = Protocol::decode_array("X?", &Protocol::encode_array(&values)).unwrap();
        assert_eq!(decoded.len(), values.len());
        for (a, b) in decoded.iter().zip(&values) {
            assert!((a - b).abs() <= 1e-12 * b.abs().max(1.0));
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Protocol::decode_array("A?", ""),
            Err(EngineError::Decode { .. })
        ));
        assert!(matches!(
            Protocol::decode_array("A?", "1.0,abc,3.0"),
            Err(EngineError::Decode { .. })
        ));
        assert!(matches!(
            Protocol::decode_array("A?", "1.0,,3.0"),
            Err(EngineError::Decode { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_non_finite_tokens() {
        for response in ["nan,nan,nan", "1.0,inf,2.0", "-infinity", "1.0,NaN"] {
            assert!(matches!(
                Protocol::decode_array("A?", response),
                Err(EngineError::Decode { .. })
            ));
        }
    }

    #[test]
    fn test_decode_scalar_requires_one_value() {
        assert_eq!(Protocol::decode_scalar("SPAN?", "1.0E+04").unwrap(), 10_000.0);
        assert!(Protocol::decode_scalar("SPAN?", "1.0,2.0").is_err());
    }

    #[test]
    fn test_decode_identity_takes_first_line() {
        let id = Protocol::decode_identity("\r\nHP4195A\r\nREV 1.0\r\n").unwrap();
        assert_eq!(id, "HP4195A");
        assert!(Protocol::decode_identity("  \r\n").is_err());
    }

    #[test]
    fn test_query_commands_round_trip() {
        for query in [Query::Magnitude, Query::Phase, Query::Frequency, Query::Center] {
            assert_eq!(Query::from_command(query.command()), Some(query));
        }
        assert_eq!(Query::from_command("FOO?"), None);
    }
}
