use crate::FIFO_LEN;
use easyerr::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FifoError {
    #[error("fifo is full")]
    Full,
}

/// A FIFO of 64-bit words with independent read and write cursors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fifo {
    rpos: usize,
    wpos: usize,
    num: usize,
    data: [u64; FIFO_LEN],
}

impl Fifo {
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.num
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.num == 0
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.num == FIFO_LEN
    }

    /// Returns the read and write cursors.
    pub fn cursors(&self) -> (usize, usize) {
        (self.rpos, self.wpos)
    }

    pub fn push(&mut self, value: u64) -> Result<(), FifoError> {
        if self.is_full() {
            return Err(FifoError::Full);
        }

        self.data[self.wpos] = value;
        self.wpos = (self.wpos + 1) % FIFO_LEN;
        self.num += 1;

        Ok(())
    }

    pub fn pop(&mut self) -> Option<u64> {
        if self.is_empty() {
            return None;
        }

        let value = self.data[self.rpos];
        self.rpos = (self.rpos + 1) % FIFO_LEN;
        self.num -= 1;

        Some(value)
    }

    /// Returns the word at the read cursor without consuming it.
    pub fn peek(&self) -> Option<u64> {
        (!self.is_empty()).then(|| self.data[self.rpos])
    }

    pub fn clear(&mut self) {
        self.rpos = 0;
        self.wpos = 0;
        self.num = 0;
    }
}

/// Selects one of the FIFOs of a TGPx4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoId {
    In,
    Out0,
    Out1,
}

/// The input FIFO and the two output FIFOs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fifos {
    pub input: Fifo,
    pub out0: Fifo,
    pub out1: Fifo,
}

impl Fifos {
    pub fn get(&self, id: FifoId) -> &Fifo {
        match id {
            FifoId::In => &self.input,
            FifoId::Out0 => &self.out0,
            FifoId::Out1 => &self.out1,
        }
    }

    pub fn get_mut(&mut self, id: FifoId) -> &mut Fifo {
        match id {
            FifoId::In => &mut self.input,
            FifoId::Out0 => &mut self.out0,
            FifoId::Out1 => &mut self.out1,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fill_is_bounded() {
        let mut fifo = Fifo::default();
        for i in 0..FIFO_LEN as u64 {
            fifo.push(i).unwrap();
            assert!(fifo.len() <= FIFO_LEN);
        }

        assert!(fifo.is_full());
        assert_eq!(fifo.push(99), Err(FifoError::Full));
        assert_eq!(fifo.len(), FIFO_LEN);

        for i in 0..FIFO_LEN as u64 {
            assert_eq!(fifo.pop(), Some(i));
        }

        assert_eq!(fifo.pop(), None);
        assert_eq!(fifo.len(), 0);
    }

    #[test]
    fn cursors_wrap() {
        let mut fifo = Fifo::default();
        for round in 0..3 * FIFO_LEN {
            let (r, w) = fifo.cursors();
            fifo.push(round as u64).unwrap();
            assert_eq!(fifo.cursors().1, (w + 1) % FIFO_LEN);

            assert_eq!(fifo.pop(), Some(round as u64));
            assert_eq!(fifo.cursors().0, (r + 1) % FIFO_LEN);
        }
    }

    #[test]
    fn clear_resets() {
        let mut fifo = Fifo::default();
        fifo.push(1).unwrap();
        fifo.push(2).unwrap();
        fifo.clear();

        assert!(fifo.is_empty());
        assert_eq!(fifo.cursors(), (0, 0));
        assert_eq!(fifo.peek(), None);
    }
}
