use crate::datatypes::{read_u16, read_u32, Signature};
use crate::utils::{EspError, Result};
use std::io::{Read, Cursor};

/// 子记录结构（一个带签名的数据块）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subrecord {
    /// 4字符签名
    pub signature: Signature,
    /// 原始数据
    pub data: Vec<u8>,
}

impl Subrecord {
    pub fn new(signature: Signature, data: Vec<u8>) -> Self {
        Subrecord { signature, data }
    }

    /// 解析子记录
    ///
    /// `XXXX` 块携带下一个子记录的真实长度（u32），下一个子记录自身的长度字段为 0。
    pub fn parse(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let (signature, size) = Self::read_header(cursor)?;

        if signature == Signature::XXXX {
            if size != 4 {
                return Err(EspError::malformed(signature, format!("expected 4 bytes, found {}", size)));
            }
            let large_size = read_u32(cursor)? as usize;
            let (signature, _) = Self::read_header(cursor)?;
            let data = Self::read_data(cursor, large_size)?;
            return Ok(Subrecord { signature, data });
        }

        let data = Self::read_data(cursor, size as usize)?;
        Ok(Subrecord { signature, data })
    }

    fn read_header(cursor: &mut Cursor<&[u8]>) -> Result<(Signature, u16)> {
        // 检查是否有足够的数据读取头部
        if cursor.position() + 6 > cursor.get_ref().len() as u64 {
            return Err(EspError::InvalidFormat("Insufficient data for subrecord header".into()));
        }

        // 读取签名 (4字节)
        let mut type_bytes = [0u8; 4];
        cursor.read_exact(&mut type_bytes)?;

        // 读取数据大小 (2字节)
        let size = read_u16(cursor)?;
        Ok((Signature(type_bytes), size))
    }

    fn read_data(cursor: &mut Cursor<&[u8]>, size: usize) -> Result<Vec<u8>> {
        if cursor.position() + size as u64 > cursor.get_ref().len() as u64 {
            return Err(EspError::InvalidFormat(format!(
                "Insufficient data for subrecord data: expected {} bytes", size
            )));
        }

        let mut data = vec![0u8; size];
        cursor.read_exact(&mut data)?;
        Ok(data)
    }

    /// 解析记录体中的全部子记录
    ///
    /// 记录末尾不足一个子记录头部的 NULL 填充会被跳过。
    pub fn parse_all(data: &[u8]) -> Result<Vec<Subrecord>> {
        let mut subrecords = Vec::new();
        let mut cursor = Cursor::new(data);

        while cursor.position() < data.len() as u64 {
            let remaining = data.len() as u64 - cursor.position();

            // 子记录最小头部大小为 6 字节 (4字节类型 + 2字节大小)
            if remaining < 6 {
                let remaining_bytes = &data[cursor.position() as usize..];

                if remaining_bytes.iter().all(|&b| b == 0) {
                    tracing::trace!(bytes = remaining, "skipping NULL padding");
                    break;
                }
                return Err(EspError::InvalidFormat(format!(
                    "{} trailing non-NULL bytes cannot form a subrecord: {:02X?}",
                    remaining, remaining_bytes
                )));
            }

            let pos_before = cursor.position();
            match Subrecord::parse(&mut cursor) {
                Ok(subrecord) => subrecords.push(subrecord),
                Err(e) => {
                    tracing::debug!(
                        offset = pos_before,
                        parsed = subrecords.len(),
                        total = data.len(),
                        "subrecord parse failed: {}", e
                    );
                    return Err(e);
                }
            }
        }

        Ok(subrecords)
    }

    /// 写入子记录（超过 65535 字节时使用 `XXXX` 前缀）
    pub fn write(&self, output: &mut Vec<u8>) {
        write_chunk(output, self.signature, &self.data);
    }

    /// 写入后占用的字节数
    pub fn encoded_len(&self) -> usize {
        if self.data.len() > u16::MAX as usize {
            10 + 6 + self.data.len()
        } else {
            6 + self.data.len()
        }
    }
}

/// 写入一个 `[签名][长度][数据]` 块
pub fn write_chunk(output: &mut Vec<u8>, signature: Signature, data: &[u8]) {
    if data.len() > u16::MAX as usize {
        output.extend_from_slice(Signature::XXXX.as_bytes());
        output.extend_from_slice(&4u16.to_le_bytes());
        output.extend_from_slice(&(data.len() as u32).to_le_bytes());
        output.extend_from_slice(signature.as_bytes());
        output.extend_from_slice(&0u16.to_le_bytes());
    } else {
        output.extend_from_slice(signature.as_bytes());
        output.extend_from_slice(&(data.len() as u16).to_le_bytes());
    }
    output.extend_from_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 测试 1 字节 NULL 填充
    #[test]
    fn test_null_padding_1byte() {
        let data = vec![
            b'E', b'D', b'I', b'D', 0x04, 0x00, // EDID, size=4
            b't', b'e', b's', b't',              // 内容 "test"
            0x00,                                 // 1 字节填充
        ];

        let subrecords = Subrecord::parse_all(&data).unwrap();
        assert_eq!(subrecords.len(), 1, "应该解析出 1 个子记录");
        assert_eq!(subrecords[0].signature, Signature::EDID);
    }

    /// 测试 4 字节 NULL 填充
    #[test]
    fn test_null_padding_4bytes() {
        let data = vec![
            b'E', b'D', b'I', b'D', 0x04, 0x00,
            b't', b'e', b's', b't',
            0x00, 0x00, 0x00, 0x00,
        ];

        let subrecords = Subrecord::parse_all(&data).unwrap();
        assert_eq!(subrecords.len(), 1);
    }

    /// 测试多个子记录 + 填充
    #[test]
    fn test_multiple_subrecords_with_padding() {
        let data = vec![
            b'E', b'D', b'I', b'D', 0x04, 0x00,
            b't', b'e', b's', b't',
            b'F', b'U', b'L', b'L', 0x05, 0x00,
            b'S', b'w', b'o', b'r', b'd',
            0x00, 0x00,
        ];

        let subrecords = Subrecord::parse_all(&data).unwrap();
        assert_eq!(subrecords.len(), 2, "应该解析出 2 个子记录");
    }

    /// 测试非 NULL 的无效尾部数据应该报错
    #[test]
    fn test_invalid_trailing_data() {
        let data = vec![
            b'E', b'D', b'I', b'D', 0x04, 0x00,
            b't', b'e', b's', b't',
            0xFF, 0xAA,
        ];

        let err = Subrecord::parse_all(&data).unwrap_err();
        assert!(err.to_string().contains("non-NULL"));
    }

    #[test]
    fn test_truncated_payload() {
        let data = vec![b'E', b'D', b'I', b'D', 0x08, 0x00, b't', b'e'];
        assert!(Subrecord::parse_all(&data).is_err());
    }

    #[test]
    fn test_large_subrecord_uses_xxxx() {
        let big = Subrecord::new(Signature(*b"DATA"), vec![7u8; 70_000]);
        let mut out = Vec::new();
        big.write(&mut out);
        assert_eq!(&out[..4], b"XXXX");
        assert_eq!(out.len(), big.encoded_len());

        let parsed = Subrecord::parse_all(&out).unwrap();
        assert_eq!(parsed, vec![big]);
    }
}
