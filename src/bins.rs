pub(crate) trait SliceExt {
    fn read_u16(&self) -> u16;
    fn read_u32(&self) -> u32;
    fn read_u64(&self) -> u64;
    fn write_u16(&mut self, val: u16);
    fn write_u32(&mut self, val: u32);
    fn write_u64(&mut self, val: u64);
}

impl SliceExt for [u8] {
    fn read_u16(&self) -> u16 {
        u16::from_be_bytes(self[..2].try_into().unwrap())
    }
    fn read_u32(&self) -> u32 {
        u32::from_be_bytes(self[..4].try_into().unwrap())
    }
    fn read_u64(&self) -> u64 {
        u64::from_be_bytes(self[..8].try_into().unwrap())
    }
    fn write_u16(&mut self, val: u16) {
        self[..2].copy_from_slice(&val.to_be_bytes());
    }
    fn write_u32(&mut self, val: u32) {
        self[..4].copy_from_slice(&val.to_be_bytes());
    }
    fn write_u64(&mut self, val: u64) {
        self[..8].copy_from_slice(&val.to_be_bytes());
    }
}
