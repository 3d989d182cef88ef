/// Whether a model reaching `new_acc` should be saved. Without `save_best` every epoch is saved,
/// with it only strict improvements over `best_acc` are.
pub fn should_save(new_acc: f32, best_acc: f32, save_best: bool) -> bool {
    !save_best || new_acc > best_acc
}

/// Tracks the accuracy watermark across a run.
#[derive(Debug, Clone, Copy)]
pub struct BestModelSelector {
    save_best: bool,
    best_acc: f32,
}

impl BestModelSelector {
    pub fn new(save_best: bool, best_acc: f32) -> Self {
        Self {
            save_best,
            best_acc,
        }
    }

    pub fn best_acc(&self) -> f32 {
        self.best_acc
    }

    /// Decides on a new validation accuracy, raising the watermark when the save is approved.
    pub fn should_save(&mut self, new_acc: f32) -> bool {
        let approved = should_save(new_acc, self.best_acc, self.save_best);
        if approved {
            self.best_acc = new_acc;
        }
        approved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saves_every_epoch_without_save_best() {
        let mut selector = BestModelSelector::new(false, 0.);

        assert!(selector.should_save(0.6));
        assert!(selector.should_save(0.4));
        assert_eq!(selector.best_acc(), 0.4);
    }

    #[test]
    fn only_strict_improvements_with_save_best() {
        let mut selector = BestModelSelector::new(true, 0.);
        let mut watermark = Vec::new();

        for acc in [0.3, 0.5, 0.5, 0.2, 0.7, 0.6] {
            selector.should_save(acc);
            watermark.push(selector.best_acc());
        }

        assert_eq!(watermark, vec![0.3, 0.5, 0.5, 0.5, 0.7, 0.7]);
        assert!(watermark.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn equal_accuracy_is_not_an_improvement() {
        assert!(!should_save(0.5, 0.5, true));
        assert!(should_save(0.5, 0.5, false));
    }
}
