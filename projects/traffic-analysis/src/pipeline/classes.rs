// Detection class table
//
// The only place model-reported ids and labels are mapped to canonical
// class names. Everything downstream uses `TrafficClass`.

use serde::Serialize;

/// Object classes counted by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficClass {
    Person,
    Bicycle,
    Car,
    Motorcycle,
    Bus,
    Truck,
}

/// COCO class id -> counted class. Ids not listed here are ignored.
const COCO_TABLE: [(usize, TrafficClass); 6] = [
    (0, TrafficClass::Person),
    (1, TrafficClass::Bicycle),
    (2, TrafficClass::Car),
    (3, TrafficClass::Motorcycle),
    (5, TrafficClass::Bus),
    (7, TrafficClass::Truck),
];

impl TrafficClass {
    pub fn from_coco_id(id: usize) -> Option<Self> {
        COCO_TABLE
            .iter()
            .find(|(coco_id, _)| *coco_id == id)
            .map(|(_, class)| *class)
    }

    /// Resolve a label reported by a detector, normalising known aliases.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "person" | "pedestrian" => Some(TrafficClass::Person),
            "bicycle" | "bike" => Some(TrafficClass::Bicycle),
            "car" => Some(TrafficClass::Car),
            "motorcycle" | "motorbike" | "motobike" => Some(TrafficClass::Motorcycle),
            "bus" => Some(TrafficClass::Bus),
            "truck" => Some(TrafficClass::Truck),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficClass::Person => "person",
            TrafficClass::Bicycle => "bicycle",
            TrafficClass::Car => "car",
            TrafficClass::Motorcycle => "motorcycle",
            TrafficClass::Bus => "bus",
            TrafficClass::Truck => "truck",
        }
    }

    /// Overlay colour (RGB) used by the annotation renderer.
    pub fn color(&self) -> [u8; 3] {
        match self {
            TrafficClass::Person => [255, 56, 56],
            TrafficClass::Bicycle => [255, 157, 151],
            TrafficClass::Car => [0, 194, 255],
            TrafficClass::Motorcycle => [255, 178, 29],
            TrafficClass::Bus => [72, 249, 10],
            TrafficClass::Truck => [146, 204, 23],
        }
    }
}
