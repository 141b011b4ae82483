use std::{
    convert::Infallible,
    fmt::{Display, Formatter},
    str::FromStr,
};

/// Physical quantity measured by a register, decoded from the device type code.
///
/// Codes the crate does not know are kept verbatim in [`RegisterType::Other`] and treated as
/// unscaled numbers.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum RegisterType {
    WholeNumber,
    ThreeDecimalNumber,
    Discrete,
    Power,
    ApparentPower,
    ReactivePower,
    Voltage,
    Current,
    Resistance,
    ElectricCharge,
    Temperature,
    Humidity,
    Pressure,
    AirQuality,
    Frequency,
    Angle,
    TotalHarmonicDistortion,
    MassFlow,
    VolumetricFlow,
    Mass,
    Speed,
    Percentage,
    Monetary,
    Irradiance,
    PartsPerMillion,
    Other(String),
}

impl RegisterType {
    pub fn code(&self) -> &str {
        match self {
            Self::WholeNumber => "#",
            Self::ThreeDecimalNumber => "#3",
            Self::Discrete => "d",
            Self::Power => "P",
            Self::ApparentPower => "S",
            Self::ReactivePower => "var",
            Self::Voltage => "V",
            Self::Current => "I",
            Self::Resistance => "R",
            Self::ElectricCharge => "Qe",
            Self::Temperature => "T",
            Self::Humidity => "h",
            Self::Pressure => "Pa",
            Self::AirQuality => "aq",
            Self::Frequency => "F",
            Self::Angle => "a",
            Self::TotalHarmonicDistortion => "THD",
            Self::MassFlow => "Q",
            Self::VolumetricFlow => "Qv",
            Self::Mass => "m",
            Self::Speed => "v",
            Self::Percentage => "%",
            Self::Monetary => "$",
            Self::Irradiance => "Ee",
            Self::PartsPerMillion => "ppm",
            Self::Other(code) => code,
        }
    }

    /// Multiplier converting a raw device counter into physical units.
    #[must_use]
    pub fn quantum(&self) -> f64 {
        match self {
            Self::WholeNumber
            | Self::Discrete
            | Self::Power
            | Self::ApparentPower
            | Self::ReactivePower
            | Self::Resistance
            | Self::Pressure
            | Self::MassFlow
            | Self::Irradiance
            | Self::Other(_) => 1.0,

            Self::ThreeDecimalNumber
            | Self::Voltage
            | Self::Current
            | Self::ElectricCharge
            | Self::Temperature
            | Self::Humidity
            | Self::AirQuality
            | Self::Frequency
            | Self::Angle
            | Self::TotalHarmonicDistortion
            | Self::Mass
            | Self::Speed
            | Self::Percentage
            | Self::PartsPerMillion => 0.001,

            Self::VolumetricFlow => 1e-9,
            Self::Monetary => 1.0 / f64::from(1_u32 << 29),
        }
    }

    /// Unit of instantaneous readings.
    #[must_use]
    pub const fn rate_unit(&self) -> Option<&'static str> {
        Some(match self {
            Self::WholeNumber | Self::ThreeDecimalNumber | Self::Discrete | Self::Other(_) => {
                return None;
            }
            Self::Power => "W",
            Self::ApparentPower => "VA",
            Self::ReactivePower => "var",
            Self::Voltage => "V",
            Self::Current => "A",
            Self::Resistance => "Ω",
            Self::ElectricCharge => "Ah",
            Self::Temperature => "°C",
            Self::Humidity | Self::TotalHarmonicDistortion | Self::Percentage => "%",
            Self::Pressure => "Pa",
            Self::AirQuality => "s",
            Self::Frequency => "Hz",
            Self::Angle => "°",
            Self::MassFlow => "g/s",
            Self::VolumetricFlow => "m³/s",
            Self::Mass => "g",
            Self::Speed => "m/s",
            Self::Monetary => "$/s",
            Self::Irradiance => "W/m²",
            Self::PartsPerMillion => "ppm",
        })
    }

    /// Unit of the cumulative counter after scaling by [`RegisterType::quantum`].
    #[must_use]
    pub const fn cumulative_unit(&self) -> Option<&'static str> {
        Some(match self {
            Self::WholeNumber | Self::ThreeDecimalNumber | Self::Discrete | Self::Other(_) => {
                return None;
            }
            Self::Power => "W·s",
            Self::ApparentPower => "VA·s",
            Self::ReactivePower => "var·s",
            Self::Voltage => "V·s",
            Self::Current => "A·s",
            Self::Resistance => "Ω·s",
            Self::ElectricCharge => "Ah·s",
            Self::Temperature => "°C·s",
            Self::Humidity | Self::TotalHarmonicDistortion | Self::Percentage => "%·s",
            Self::Pressure => "Pa·s",
            Self::AirQuality => "s·s",
            Self::Frequency => "Hz·s",
            Self::Angle => "°·s",
            Self::MassFlow => "g",
            Self::VolumetricFlow => "m³",
            Self::Mass => "g·s",
            Self::Speed => "m",
            Self::Monetary => "$",
            Self::Irradiance => "W·s/m²",
            Self::PartsPerMillion => "ppm·s",
        })
    }
}

impl FromStr for RegisterType {
    type Err = Infallible;

    fn from_str(code: &str) -> Result<Self, Self::Err> {
        Ok(match code {
            "#" => Self::WholeNumber,
            "#3" => Self::ThreeDecimalNumber,
            "d" => Self::Discrete,
            "P" => Self::Power,
            "S" => Self::ApparentPower,
            "var" => Self::ReactivePower,
            "V" => Self::Voltage,
            "I" => Self::Current,
            "R" => Self::Resistance,
            "Qe" => Self::ElectricCharge,
            "T" => Self::Temperature,
            "h" => Self::Humidity,
            "Pa" => Self::Pressure,
            "aq" => Self::AirQuality,
            "F" => Self::Frequency,
            "a" => Self::Angle,
            "THD" => Self::TotalHarmonicDistortion,
            "Q" => Self::MassFlow,
            "Qv" => Self::VolumetricFlow,
            "m" => Self::Mass,
            "v" => Self::Speed,
            "%" => Self::Percentage,
            "$" => Self::Monetary,
            "Ee" => Self::Irradiance,
            "ppm" => Self::PartsPerMillion,
            other => Self::Other(other.to_owned()),
        })
    }
}

impl From<&str> for RegisterType {
    fn from(code: &str) -> Self {
        match code.parse() {
            Ok(register_type) => register_type,
            Err(infallible) => match infallible {},
        }
    }
}

impl Display for RegisterType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}
