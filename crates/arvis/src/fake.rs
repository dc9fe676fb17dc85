//! In-memory fake camera.
//!
//! The fake device exposes a register space with the GigE bootstrap layout,
//! a GenICam document stored in device memory, and a handful of sensor
//! registers the document points at. It backs the `Fake` interface and the
//! integration tests; no sockets are involved.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use tl_gige::bootstrap::regs;

use crate::device::{Device, DeviceError};

/// Vendor reported by the fake camera.
pub const FAKE_VENDOR: &str = "Arvis";
/// Model reported by the fake camera.
pub const FAKE_MODEL: &str = "Fake";
/// Serial number reported by the fake camera.
pub const FAKE_SERIAL: &str = "GV01";

/// Feature register block of the fake camera.
mod feature_regs {
    pub const WIDTH: u64 = 0x1_0000;
    pub const HEIGHT: u64 = 0x1_0004;
    pub const PIXEL_FORMAT: u64 = 0x1_0008;
    pub const ACQUISITION: u64 = 0x1_000C;
    pub const GAIN_RAW: u64 = 0x1_0010;
    pub const EXPOSURE_RAW: u64 = 0x1_0014;
}

/// Where the GenICam document lives in fake device memory.
const XML_ADDRESS: u64 = 0x3_0000;

const FAKE_GENICAM_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<RegisterDescription ModelName="Fake" VendorName="Arvis"
    SchemaMajorVersion="1" SchemaMinorVersion="1" SchemaSubMinorVersion="0">
  <Category Name="Root">
    <pFeature>Width</pFeature>
    <pFeature>Height</pFeature>
    <pFeature>PixelFormat</pFeature>
    <pFeature>Gain</pFeature>
    <pFeature>ExposureTime</pFeature>
    <pFeature>AcquisitionStart</pFeature>
    <pFeature>AcquisitionStop</pFeature>
  </Category>
  <Integer Name="Width">
    <pValue>WidthReg</pValue>
    <Min>1</Min>
    <Max>2048</Max>
  </Integer>
  <IntReg Name="WidthReg">
    <Address>0x10000</Address>
    <Length>4</Length>
    <AccessMode>RW</AccessMode>
    <Cachable>WriteThrough</Cachable>
    <Endianess>BigEndian</Endianess>
  </IntReg>
  <Integer Name="Height">
    <pValue>HeightReg</pValue>
    <Min>1</Min>
    <Max>2048</Max>
  </Integer>
  <IntReg Name="HeightReg">
    <Address>0x10004</Address>
    <Length>4</Length>
    <AccessMode>RW</AccessMode>
    <Cachable>WriteThrough</Cachable>
    <Endianess>BigEndian</Endianess>
  </IntReg>
  <Enumeration Name="PixelFormat">
    <EnumEntry Name="Mono8">
      <Value>17301505</Value>
    </EnumEntry>
    <EnumEntry Name="Mono16">
      <Value>17825799</Value>
    </EnumEntry>
    <pValue>PixelFormatReg</pValue>
  </Enumeration>
  <IntReg Name="PixelFormatReg">
    <Address>0x10008</Address>
    <Length>4</Length>
    <AccessMode>RW</AccessMode>
    <Cachable>WriteThrough</Cachable>
    <Endianess>BigEndian</Endianess>
  </IntReg>
  <Converter Name="Gain">
    <FormulaTo>FROM * 10</FormulaTo>
    <FormulaFrom>TO / 10</FormulaFrom>
    <pValue>GainRawReg</pValue>
  </Converter>
  <IntReg Name="GainRawReg">
    <Address>0x10010</Address>
    <Length>4</Length>
    <AccessMode>RW</AccessMode>
    <Cachable>WriteThrough</Cachable>
    <Endianess>BigEndian</Endianess>
  </IntReg>
  <Float Name="ExposureTime">
    <pValue>ExposureConv</pValue>
    <Min>10.0</Min>
    <Max>1000000.0</Max>
  </Float>
  <Converter Name="ExposureConv">
    <FormulaTo>FROM</FormulaTo>
    <FormulaFrom>TO</FormulaFrom>
    <pValue>ExposureReg</pValue>
  </Converter>
  <IntReg Name="ExposureReg">
    <Address>0x10014</Address>
    <Length>4</Length>
    <AccessMode>RW</AccessMode>
    <Cachable>WriteThrough</Cachable>
    <Endianess>BigEndian</Endianess>
  </IntReg>
  <Command Name="AcquisitionStart">
    <pValue>AcquisitionReg</pValue>
    <CommandValue>1</CommandValue>
  </Command>
  <Command Name="AcquisitionStop">
    <pValue>AcquisitionReg</pValue>
    <CommandValue>0</CommandValue>
  </Command>
  <IntReg Name="AcquisitionReg">
    <Address>0x1000C</Address>
    <Length>4</Length>
    <AccessMode>RW</AccessMode>
    <Cachable>NoCache</Cachable>
    <Endianess>BigEndian</Endianess>
  </IntReg>
  <Port Name="Device"/>
</RegisterDescription>
"#;

/// The fake device: a lock around a flat register space.
pub struct FakeDevice {
    memory: Mutex<Vec<u8>>,
}

impl FakeDevice {
    /// Build a fake device with its bootstrap block and document filled in.
    pub fn new() -> Arc<Self> {
        let mut memory = vec![0u8; 0x4_0000];

        write_u32(&mut memory, regs::VERSION, (2 << 16) | 1);
        write_string(&mut memory, regs::MANUFACTURER_NAME, FAKE_VENDOR);
        write_string(&mut memory, regs::MODEL_NAME, FAKE_MODEL);
        write_string(&mut memory, regs::SERIAL_NUMBER, FAKE_SERIAL);
        write_string(&mut memory, regs::DEVICE_VERSION, "0.1.0");
        write_u32(&mut memory, regs::HEARTBEAT_TIMEOUT, 3000);
        write_u32(&mut memory, regs::N_STREAM_CHANNELS, 1);

        let url = format!(
            "Local:arvis-fake.xml;{:X};{:X}",
            XML_ADDRESS,
            FAKE_GENICAM_XML.len()
        );
        write_string(&mut memory, regs::XML_URL_0, &url);
        let xml_start = XML_ADDRESS as usize;
        memory[xml_start..xml_start + FAKE_GENICAM_XML.len()]
            .copy_from_slice(FAKE_GENICAM_XML.as_bytes());

        write_u32(&mut memory, feature_regs::WIDTH, 512);
        write_u32(&mut memory, feature_regs::HEIGHT, 512);
        write_u32(&mut memory, feature_regs::PIXEL_FORMAT, 0x0108_0001);
        write_u32(&mut memory, feature_regs::ACQUISITION, 0);
        write_u32(&mut memory, feature_regs::GAIN_RAW, 0);
        write_u32(&mut memory, feature_regs::EXPOSURE_RAW, 10_000);

        Arc::new(Self {
            memory: Mutex::new(memory),
        })
    }
}

fn write_u32(memory: &mut [u8], address: u64, value: u32) {
    let start = address as usize;
    memory[start..start + 4].copy_from_slice(&value.to_be_bytes());
}

fn write_string(memory: &mut [u8], address: u64, value: &str) {
    let start = address as usize;
    memory[start..start + value.len()].copy_from_slice(value.as_bytes());
}

#[async_trait]
impl Device for FakeDevice {
    async fn read_memory(&self, address: u64, size: usize) -> Result<Vec<u8>, DeviceError> {
        let memory = self.memory.lock().await;
        let start = address as usize;
        if start + size > memory.len() {
            return Err(DeviceError::Genicam(format!(
                "read of {size} bytes at {address:#x} outside fake register space"
            )));
        }
        Ok(memory[start..start + size].to_vec())
    }

    async fn write_memory(&self, address: u64, data: &[u8]) -> Result<(), DeviceError> {
        let mut memory = self.memory.lock().await;
        let start = address as usize;
        if start + data.len() > memory.len() {
            return Err(DeviceError::Genicam(format!(
                "write of {} bytes at {address:#x} outside fake register space",
                data.len()
            )));
        }
        memory[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    async fn read_register(&self, address: u64) -> Result<u32, DeviceError> {
        let bytes = self.read_memory(address, 4).await?;
        Ok(u32::from_be_bytes(bytes.try_into().expect("4 bytes")))
    }

    async fn write_register(&self, address: u64, value: u32) -> Result<(), DeviceError> {
        self.write_memory(address, &value.to_be_bytes()).await
    }

    async fn genicam_xml(&self) -> Result<String, DeviceError> {
        Ok(FAKE_GENICAM_XML.to_string())
    }

    async fn close(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tl_gige::bootstrap::{parse_fixed_string, parse_genicam_url, GenicamUrl};

    #[tokio::test]
    async fn bootstrap_strings_are_readable() {
        let device = FakeDevice::new();
        let vendor = device
            .read_memory(regs::MANUFACTURER_NAME, regs::MANUFACTURER_NAME_SIZE)
            .await
            .expect("read");
        assert_eq!(parse_fixed_string(&vendor).as_deref(), Some(FAKE_VENDOR));
        let serial = device
            .read_memory(regs::SERIAL_NUMBER, regs::SERIAL_NUMBER_SIZE)
            .await
            .expect("read");
        assert_eq!(parse_fixed_string(&serial).as_deref(), Some(FAKE_SERIAL));
    }

    #[tokio::test]
    async fn xml_url_points_at_stored_document() {
        let device = FakeDevice::new();
        let url_bytes = device
            .read_memory(regs::XML_URL_0, regs::XML_URL_SIZE)
            .await
            .expect("read");
        let url = parse_fixed_string(&url_bytes).expect("url");
        let GenicamUrl::Local {
            address, length, ..
        } = parse_genicam_url(&url).expect("parse")
        else {
            panic!("fake URL must be local");
        };
        let xml = device
            .read_memory(address, length as usize)
            .await
            .expect("read");
        let text = String::from_utf8(xml).expect("utf8");
        assert!(text.contains("RegisterDescription"));
        assert_eq!(text, FAKE_GENICAM_XML);
    }

    #[tokio::test]
    async fn registers_roundtrip() {
        let device = FakeDevice::new();
        assert_eq!(
            device.read_register(feature_regs::WIDTH).await.expect("read"),
            512
        );
        device
            .write_register(feature_regs::WIDTH, 1024)
            .await
            .expect("write");
        assert_eq!(
            device.read_register(feature_regs::WIDTH).await.expect("read"),
            1024
        );
    }
}
