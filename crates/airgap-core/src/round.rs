//! Threshold bookkeeping for one signing flow

use crate::{Error, Result, SignatureShare};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Counters embedded in every unsigned payload so the cold device knows how
/// many signatures are still outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundCounters {
    /// Signatures needed to spend (m)
    pub required: usize,
    /// Authorized signers (n)
    pub total: usize,
    /// Signatures still outstanding
    pub remaining: usize,
}

/// Collected signatures for an m-of-n spend.
///
/// `remaining` counts down from the threshold; the round is complete when it
/// reaches zero. `remaining + collected == required` holds after every call.
#[derive(Debug, Clone)]
pub struct SigningRound {
    id: Uuid,
    required: usize,
    total: usize,
    remaining: usize,
    collected: Vec<SignatureShare>,
}

impl SigningRound {
    /// Start a round with nothing collected
    pub fn new(required: usize, total: usize) -> Result<Self> {
        Self::resume(required, total, Vec::new())
    }

    /// Start a round that already holds some signatures
    pub fn resume(required: usize, total: usize, collected: Vec<SignatureShare>) -> Result<Self> {
        if required == 0 {
            return Err(Error::InvalidConfig("Threshold must be at least 1".into()));
        }
        if required > total {
            return Err(Error::InvalidConfig(
                "Threshold cannot exceed number of signers".into(),
            ));
        }
        if collected.len() > required {
            return Err(Error::SignatureCountExceeded {
                required,
                received: collected.len(),
            });
        }

        Ok(Self {
            id: Uuid::new_v4(),
            required,
            total,
            remaining: required - collected.len(),
            collected,
        })
    }

    /// Add a signature share, returning how many are still outstanding
    pub fn accept(&mut self, share: SignatureShare) -> Result<usize> {
        if self.collected.contains(&share) {
            return Err(Error::DuplicateSignature);
        }
        if self.remaining == 0 {
            return Err(Error::SignatureCountExceeded {
                required: self.required,
                received: self.collected.len() + 1,
            });
        }

        self.collected.push(share);
        self.remaining -= 1;
        debug_assert_eq!(self.remaining + self.collected.len(), self.required);

        debug!(
            round = %self.id,
            collected = self.collected.len(),
            remaining = self.remaining,
            "Signature accepted"
        );
        Ok(self.remaining)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn required(&self) -> usize {
        self.required
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn collected(&self) -> &[SignatureShare] {
        &self.collected
    }

    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    pub fn counters(&self) -> RoundCounters {
        RoundCounters {
            required: self.required,
            total: self.total,
            remaining: self.remaining,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RecoverableSignature;

    fn share(tag: u8) -> SignatureShare {
        SignatureShare::Account(RecoverableSignature::new([tag; 32], [tag; 32], 0))
    }

    #[test]
    fn test_two_of_three_completes_after_two() {
        let mut round = SigningRound::new(2, 3).unwrap();
        assert_eq!(round.remaining(), 2);

        // any two of the three signers
        assert_eq!(round.accept(share(3)).unwrap(), 1);
        assert!(!round.is_complete());
        assert_eq!(round.accept(share(1)).unwrap(), 0);
        assert!(round.is_complete());
        assert_eq!(round.collected().len(), 2);
    }

    #[test]
    fn test_invariant_holds_through_round() {
        let mut round = SigningRound::new(3, 5).unwrap();
        for tag in 0..3 {
            assert_eq!(round.remaining() + round.collected().len(), round.required());
            round.accept(share(tag)).unwrap();
        }
        assert_eq!(round.remaining() + round.collected().len(), round.required());
    }

    #[test]
    fn test_extra_signature_rejected() {
        let mut round = SigningRound::new(1, 2).unwrap();
        round.accept(share(1)).unwrap();

        let err = round.accept(share(2)).unwrap_err();
        assert!(matches!(err, Error::SignatureCountExceeded { .. }));
        assert_eq!(round.collected().len(), 1);
    }

    #[test]
    fn test_duplicate_signature_not_counted() {
        let mut round = SigningRound::new(2, 3).unwrap();
        round.accept(share(7)).unwrap();

        assert!(matches!(round.accept(share(7)), Err(Error::DuplicateSignature)));
        assert_eq!(round.remaining(), 1);
    }

    #[test]
    fn test_resume_counts_collected() {
        let round = SigningRound::resume(3, 3, vec![share(1)]).unwrap();
        assert_eq!(round.remaining(), 2);

        assert!(SigningRound::resume(1, 3, vec![share(1), share(2)]).is_err());
        assert!(SigningRound::new(4, 3).is_err());
        assert!(SigningRound::new(0, 3).is_err());
    }
}
